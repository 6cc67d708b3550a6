use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Stdio};

use revmedia_common::frames;

const TN_SIZE: u32 = 300;

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// 5 seconds of testsrc at 30 fps, mpeg4 in mp4. With `faststart` the moov
/// atom leads the file and the container pipes cleanly; without it the moov
/// trails and piped decoding finds no frames.
fn make_test_video(path: &Path, faststart: bool) {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-f",
        "lavfi",
        "-i",
        "testsrc=duration=5:size=320x240:rate=30",
        "-c:v",
        "mpeg4",
        "-q:v",
        "5",
    ]);
    if faststart {
        cmd.args(["-movflags", "+faststart"]);
    }
    cmd.arg(path.as_os_str());
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to execute ffmpeg");
    assert!(status.success(), "ffmpeg could not create the test video");
}

fn video_bytes(faststart: bool) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testvideo.mp4");
    make_test_video(&path, faststart);
    std::fs::read(&path).unwrap()
}

#[test]
fn sampled_frames_are_deduped_and_stable() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg is not installed, skipping");
        return;
    }
    let bytes = video_bytes(true);

    let first = frames::extract(&bytes, "mp4", TN_SIZE).unwrap();
    assert!(!first.frames.is_empty());

    // every 6th of 150 frames plus keyframes, minus visually identical ones
    assert!(first.frames.len() <= 150);

    let unique: HashSet<_> = first.frames.iter().map(|f| f.hash).collect();
    assert_eq!(unique.len(), first.frames.len());

    for frame in &first.frames {
        assert!(frame.thumb.width().max(frame.thumb.height()) <= TN_SIZE);
    }

    let second = frames::extract(&bytes, "mp4", TN_SIZE).unwrap();
    let first_hashes: Vec<_> = first.frames.iter().map(|f| f.hash).collect();
    let second_hashes: Vec<_> = second.frames.iter().map(|f| f.hash).collect();
    assert_eq!(first_hashes, second_hashes);
}

#[test]
fn probe_reports_the_stream() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg is not installed, skipping");
        return;
    }
    let bytes = video_bytes(true);

    let extraction = frames::extract(&bytes, "mp4", TN_SIZE).unwrap();
    let info = extraction.info;
    assert_eq!(320, info.width);
    assert_eq!(240, info.height);
    assert_eq!("mpeg4", info.codec);
    assert_eq!(5, info.duration);
    assert!(!info.format.is_empty());
}

#[test]
fn trailing_moov_mp4_takes_the_disk_fallback() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg is not installed, skipping");
        return;
    }
    let bytes = video_bytes(false);

    let extraction = frames::extract(&bytes, "mp4", TN_SIZE).unwrap();
    assert!(
        !extraction.frames.is_empty(),
        "the disk fallback must recover the frames"
    );
    assert_eq!(320, extraction.info.width);

    // the fallback is deterministic too
    let again = frames::extract(&bytes, "mp4", TN_SIZE).unwrap();
    assert_eq!(
        extraction.frames.iter().map(|f| f.hash).collect::<Vec<_>>(),
        again.frames.iter().map(|f| f.hash).collect::<Vec<_>>(),
    );
}
