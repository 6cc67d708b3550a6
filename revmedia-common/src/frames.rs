use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use color_eyre::eyre::{self, Context};
use image::DynamicImage;
use image::RgbImage;
use serde::Deserialize;

use crate::imghash::{self, hamming::Hamming};

pub type Result<T> = eyre::Result<T>;

/// How much of the decoder's stdout is consumed per read.
pub const CHUNK_LENGTH: usize = 1024 * 24;

/// A sampled video frame: its fingerprint plus the thumbnail that gets
/// written to disk for the result pages.
#[derive(Debug, Clone)]
pub struct Frame {
    pub hash: Hamming,
    pub thumb: RgbImage,
}

/// Flattened ffprobe output for the video stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: i64,
    pub duration: i64,
    pub total_frames: i64,
    pub format: String,
}

#[derive(Debug)]
pub struct Extraction {
    pub frames: Vec<Frame>,
    pub info: VideoInfo,
}

/// Decode a video held in memory and return its sampled frames plus stream
/// metadata. Frames are selected by `(index % 6 == 0) || keyframe` and
/// deduplicated by hash, so static segments collapse to one entry.
///
/// An mp4 whose moov atom sits at the end of the file cannot be decoded
/// through a pipe; when that yields zero frames the bytes are spooled to a
/// temporary file and decoded from disk, once.
pub fn extract(bytes: &[u8], ext: &str, tn_size: u32) -> Result<Extraction> {
    let frames = carve_frames_piped(bytes, ext, tn_size)
        .wrap_err("failed to extract frames from the pipe")?;

    if frames.is_empty() && ext == "mp4" {
        log::debug!("Got no frames out of a piped mp4, retrying from disk");
        let tmp = tempfile::NamedTempFile::new().wrap_err("failed to create a spool file")?;
        std::fs::write(tmp.path(), bytes).wrap_err("failed to spool the video")?;

        let frames = carve_frames_disk(tmp.path(), tn_size)
            .wrap_err("failed to extract frames from disk")?;
        let info = probe_disk(tmp.path()).wrap_err("failed to probe from disk")?;
        return Ok(Extraction { frames, info });
    }

    let info = probe_piped(bytes).wrap_err("failed to probe the pipe")?;
    Ok(Extraction { frames, info })
}

// Every selected frame comes out as one JPEG on a single stream, no length
// prefix, so the EOI marker is the only frame boundary.
const SELECT_FILTER: &str = "select=not(mod(n\\,6))+eq(pict_type\\,I)";

fn extract_args(input: &str, format_hint: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-threads".into(), "1".into()];
    if let Some(hint) = format_hint {
        args.push("-f".into());
        args.push(hint.into());
    }
    args.extend(
        [
            "-i", input, "-vf", SELECT_FILTER, "-vsync", "0", "-f", "image2pipe", "-c:v",
            "mjpeg", "-loglevel", "error", "pipe:1",
        ]
        .map(String::from),
    );
    args
}

fn format_hint(ext: &str) -> Option<&str> {
    match ext {
        "mp4" => Some("mp4"),
        "webm" => Some("webm"),
        _ => None,
    }
}

fn carve_frames_piped(bytes: &[u8], ext: &str, tn_size: u32) -> Result<Vec<Frame>> {
    let args = extract_args("pipe:0", format_hint(ext));
    run_piped("ffmpeg", &args, bytes, |stdout| carve_frames(stdout, tn_size))
}

fn carve_frames_disk(path: &Path, tn_size: u32) -> Result<Vec<Frame>> {
    let path = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("spool path is not valid unicode"))?;
    let args = extract_args(path, None);

    let child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .wrap_err("failed to spawn ffmpeg")?;
    let mut guard = ChildGuard(child);

    let stdout = guard.0.stdout.take().expect("stdout was piped");
    carve_frames(stdout, tn_size)
}

/// Scan the concatenated JPEG stream, closing a frame at every EOI marker.
/// The first two bytes (the initial SOI) are consumed up front so the scan
/// only ever sees `FF D9` at real frame ends.
fn carve_frames<R: Read>(mut stdout: R, tn_size: u32) -> Result<Vec<Frame>> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut seen: HashSet<Hamming> = HashSet::new();

    let mut soi = [0u8; 2];
    match stdout.read_exact(&mut soi) {
        Ok(()) => (),
        // the decoder produced nothing at all
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(frames),
        Err(e) => return Err(e).wrap_err("failed to read from the decoder"),
    }

    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_LENGTH);
    buf.extend_from_slice(&soi);

    let mut chunk = vec![0u8; CHUNK_LENGTH];
    let mut last_byte_was_marker = false;
    loop {
        let n = stdout
            .read(&mut chunk)
            .wrap_err("failed to read from the decoder")?;
        if n == 0 {
            break;
        }

        for &b in &chunk[..n] {
            buf.push(b);
            if last_byte_was_marker && b == 0xD9 {
                finish_frame(&mut buf, tn_size, &mut seen, &mut frames);
            }
            last_byte_was_marker = b == 0xFF;
        }
    }

    Ok(frames)
}

fn finish_frame(
    buf: &mut Vec<u8>,
    tn_size: u32,
    seen: &mut HashSet<Hamming>,
    frames: &mut Vec<Frame>,
) {
    match image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg) {
        Ok(img) => {
            let thumb = thumbnail(img, tn_size);
            let hash = imghash::hash(&thumb);
            if seen.insert(hash) {
                frames.push(Frame { hash, thumb });
            }
        }
        Err(e) => log::warn!("Skipping an undecodable carved frame: {e}"),
    }
    buf.clear();
}

/// Shrink so the longest edge is at most `tn_size`, never upscaling.
pub fn thumbnail(img: DynamicImage, tn_size: u32) -> RgbImage {
    let img = if img.width() > tn_size || img.height() > tn_size {
        img.thumbnail(tn_size, tn_size)
    } else {
        img
    };
    img.to_rgb8()
}

const PROBE_ARGS: &[&str] = &[
    "-v",
    "quiet",
    "-print_format",
    "json=c=1",
    "-show_format",
    "-show_streams",
];

fn probe_piped(bytes: &[u8]) -> Result<VideoInfo> {
    let mut args: Vec<String> = PROBE_ARGS.iter().map(|s| s.to_string()).collect();
    args.push("pipe:0".into());
    let json = run_piped("ffprobe", &args, bytes, |mut stdout| {
        let mut out = Vec::new();
        stdout
            .read_to_end(&mut out)
            .wrap_err("failed to read ffprobe output")?;
        Ok(out)
    })?;
    parse_probe(&json)
}

fn probe_disk(path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args(PROBE_ARGS)
        .arg(path)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .wrap_err("failed to run ffprobe")?;
    parse_probe(&output.stdout)
}

/// Spawn `program`, feed `bytes` to its stdin from a separate thread and
/// hand stdout to `read`. The child is killed on every exit path, which also
/// unblocks the feeder if the reader bails early.
fn run_piped<T>(
    program: &str,
    args: &[String],
    bytes: &[u8],
    read: impl FnOnce(std::process::ChildStdout) -> Result<T>,
) -> Result<T> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .wrap_err_with(|| format!("failed to spawn {program}"))?;
    let mut guard = ChildGuard(child);

    let mut stdin = guard.0.stdin.take().expect("stdin was piped");
    let stdout = guard.0.stdout.take().expect("stdout was piped");

    thread::scope(|s| {
        let feeder = s.spawn(move || {
            // EPIPE just means the decoder stopped caring
            let _ = stdin.write_all(bytes);
        });

        let result = read(stdout);
        drop(guard);
        let _ = feeder.join();
        result
    })
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[derive(Deserialize)]
struct Probe {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    // ffprobe prints numbers as strings
    bit_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    format_long_name: Option<String>,
}

fn parse_probe(json: &[u8]) -> Result<VideoInfo> {
    let probe: Probe = serde_json::from_slice(json).wrap_err("unparsable ffprobe output")?;
    let mut info = VideoInfo::default();

    if let Some(stream) = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
    {
        info.codec = stream.codec_name.clone().unwrap_or_default();
        info.width = stream.width.unwrap_or(0);
        info.height = stream.height.unwrap_or(0);
        info.bitrate = parse_number(stream.bit_rate.as_deref());
        info.total_frames = parse_number(stream.nb_frames.as_deref());
        info.duration = parse_seconds(stream.duration.as_deref()).unwrap_or_else(|| {
            parse_seconds(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
                .unwrap_or(0)
        });
    }

    if let Some(format) = &probe.format {
        info.format = format.format_long_name.clone().unwrap_or_default();
    }

    Ok(info)
}

fn parse_number(value: Option<&str>) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn parse_seconds(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.parse::<f64>().ok()).map(|v| v as i64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode_jpeg(img: RgbImage) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn ramp(width: u32, height: u32, reversed: bool) -> Vec<u8> {
        encode_jpeg(RgbImage::from_fn(width, height, |x, _| {
            let x = if reversed { width - 1 - x } else { x };
            let v = (x * 255 / width) as u8;
            image::Rgb([v, v, v])
        }))
    }

    #[test]
    fn carves_concatenated_jpegs() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&ramp(64, 48, false));
        stream.extend_from_slice(&ramp(64, 48, true));
        let frames = carve_frames(stream.as_slice(), 100).unwrap();
        assert_eq!(2, frames.len());
        assert_ne!(frames[0].hash, frames[1].hash);
    }

    #[test]
    fn identical_frames_collapse() {
        let one = ramp(64, 48, false);
        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(&one);
        }
        let frames = carve_frames(stream.as_slice(), 100).unwrap();
        assert_eq!(1, frames.len());
    }

    #[test]
    fn empty_stream_is_no_frames() {
        let frames = carve_frames(std::io::empty(), 100).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn thumbnail_caps_long_edge() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(1000, 400));
        let thumb = thumbnail(img, 500);
        assert_eq!(500, thumb.width().max(thumb.height()));

        let small = DynamicImage::ImageRgb8(RgbImage::new(100, 80));
        let kept = thumbnail(small, 500);
        assert_eq!((100, 80), (kept.width(), kept.height()));
    }

    #[test]
    fn parses_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type":"audio","codec_name":"aac"},
                {"codec_type":"video","codec_name":"h264","width":1280,"height":720,
                 "bit_rate":"1000000","nb_frames":"150","duration":"5.000000"}
            ],
            "format": {"format_long_name":"QuickTime / MOV","duration":"5.020000"}
        }"#;
        let info = parse_probe(json.as_bytes()).unwrap();
        assert_eq!("h264", info.codec);
        assert_eq!((1280, 720), (info.width, info.height));
        assert_eq!(1_000_000, info.bitrate);
        assert_eq!(150, info.total_frames);
        assert_eq!(5, info.duration);
        assert_eq!("QuickTime / MOV", info.format);
    }

    #[test]
    fn probe_duration_falls_back_to_format() {
        let json = r#"{
            "streams": [{"codec_type":"video","codec_name":"vp9","width":640,"height":480}],
            "format": {"format_long_name":"WebM","duration":"12.5"}
        }"#;
        let info = parse_probe(json.as_bytes()).unwrap();
        assert_eq!(12, info.duration);
        assert_eq!(0, info.bitrate);
    }
}
