//! Symphonia decoder tests against generated WAV fixtures

use attacca_engine::{
    decoder, AudioFormat, EngineConfig, HostTicks, PlayerNode, SampleBuffer,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const FRAMES: u32 = 4_410;

/// Expected f32 value of left-channel frame `i` after i16 normalization.
fn expected_left(i: u32) -> f32 {
    sample_i16(i) as f32 / 32_768.0
}

fn sample_i16(i: u32) -> i16 {
    ((i % 1_000) as i32 * 16 - 8_000) as i16
}

/// Write a stereo 16-bit 44.1kHz WAV with a deterministic ramp pattern.
fn write_test_wav(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("ramp.wav");
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..FRAMES {
        writer.write_sample(sample_i16(i)).unwrap();
        writer.write_sample(-sample_i16(i)).unwrap();
    }
    writer.finalize().unwrap();
    path
}

#[test]
fn registry_opens_and_decodes_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_wav(&dir);

    let mut dec = decoder::open_path(&path).unwrap();
    dec.open().unwrap();
    assert_eq!(dec.processing_format(), AudioFormat::stereo_44100());
    assert_eq!(dec.total_frames(), Some(FRAMES as u64));
    assert!(dec.supports_seeking());

    let mut buf = SampleBuffer::with_capacity(2, 512);
    let mut decoded = 0u32;
    loop {
        let n = dec.decode_into(&mut buf, 512).unwrap();
        if n == 0 {
            break;
        }
        for i in 0..n {
            let frame = decoded + i as u32;
            assert!(
                (buf.channel(0)[i] - expected_left(frame)).abs() < 1e-4,
                "left frame {} mismatch",
                frame
            );
            assert!(
                (buf.channel(1)[i] + expected_left(frame)).abs() < 1e-4,
                "right frame {} mismatch",
                frame
            );
        }
        decoded += n as u32;
    }
    assert_eq!(decoded, FRAMES);

    // A drained decoder keeps reporting end of stream.
    assert_eq!(dec.decode_into(&mut buf, 512).unwrap(), 0);
    dec.close().unwrap();
}

#[test]
fn wav_seek_repositions_accurately() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_wav(&dir);

    let mut dec = decoder::open_path(&path).unwrap();
    dec.open().unwrap();

    // Consume a little, then jump.
    let mut buf = SampleBuffer::with_capacity(2, 256);
    dec.decode_into(&mut buf, 256).unwrap();

    dec.seek_to_frame(1_000).unwrap();
    let n = dec.decode_into(&mut buf, 16).unwrap();
    assert!(n > 0);
    assert!(
        (buf.channel(0)[0] - expected_left(1_000)).abs() < 1e-4,
        "first frame after seek should be frame 1000"
    );

    // Seeking back to the head also works.
    dec.seek_to_frame(0).unwrap();
    let n = dec.decode_into(&mut buf, 16).unwrap();
    assert!(n > 0);
    assert!((buf.channel(0)[0] - expected_left(0)).abs() < 1e-4);
}

#[test]
fn node_plays_a_wav_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_test_wav(&dir);

    let config = EngineConfig {
        ring_buffer_frames: 16_384,
        ..EngineConfig::default()
    };
    let mut node = PlayerNode::with_config(AudioFormat::stereo_44100(), config).unwrap();
    let mut ctx = node.take_render_context().unwrap();

    node.enqueue_path(&path).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let handle = loop {
        if let Some(handle) = node.current_decoder() {
            break handle;
        }
        assert!(Instant::now() < deadline, "decoder never became current");
        std::thread::sleep(Duration::from_millis(2));
    };

    node.play();

    let mut out = SampleBuffer::with_capacity(2, 512);
    let mut t = HostTicks::from_ticks(0);
    let mut total = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = ctx.render(&mut out, 512, t);
        t = t.adding_frames(512, 44_100);
        total += status.frames_rendered;
        if handle.is_rendering_complete() {
            break;
        }
        assert!(Instant::now() < deadline, "playback never completed");
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(total, FRAMES as usize);
    assert_eq!(handle.frames_rendered(), FRAMES as u64);
}
