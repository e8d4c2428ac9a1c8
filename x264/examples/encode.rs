//! Encodes raw planar YUV video to an H.264 Annex B elementary stream.

use av_traits::{BitrateControl as _, VideoEncoder as _};
use clap::Parser;
use std::io::{Read as _, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use x264::{PixelFormat, StreamParameters, X264Encoder, X264Engine};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    width: u16,

    #[arg(long)]
    height: u16,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Target bitrate in bits/second.
    #[arg(long, default_value_t = 2_000_000)]
    bitrate: u32,

    #[arg(long, default_value_t = 60)]
    keyframe_interval: u32,

    /// Forces a key frame every this many frames.
    #[arg(long)]
    force_keyframe_interval: Option<u64>,

    #[arg(long, default_value = "veryfast")]
    preset: String,

    /// Changes the bitrate to `--new-bitrate` after this many frames.
    #[arg(long, requires = "new_bitrate")]
    bitrate_change_at: Option<u64>,

    #[arg(long)]
    new_bitrate: Option<u32>,

    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    output: PathBuf,
}

/// One I420 frame in a single buffer.
struct Frame {
    data: Vec<u8>,
    plane_offsets: Arc<[usize; 4]>,
}

impl av_traits::RawVideoFrame<u8> for Frame {
    fn samples(&self, plane: usize) -> &[u8] {
        &self.data[self.plane_offsets[plane]..self.plane_offsets[plane + 1]]
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut infile = std::fs::File::open(&args.input).unwrap();
    let mut outfile = std::fs::File::create(&args.output).unwrap();

    let params = StreamParameters {
        pixel_format: PixelFormat::I420,
        width: args.width,
        height: args.height,
        fps: args.fps,
        keyframe_interval: args.keyframe_interval,
        bitrate: args.bitrate,
        vbv_max_bitrate: args.bitrate,
        vbv_buffer_size: args.bitrate,
    };
    let mut encoder = X264Encoder::new(&X264Engine, &params, &args.preset).unwrap();

    let layout = encoder.session().layout().clone();
    let mut plane_offsets = [0; 4];
    for plane in 0..3 {
        plane_offsets[plane + 1] = plane_offsets[plane] + layout.plane_len(plane);
    }
    let plane_offsets = Arc::new(plane_offsets);
    let frame_len = plane_offsets[3] as u64;

    let len = infile.metadata().unwrap().len();
    let frames_in = len / frame_len;
    if len % frame_len != 0 {
        panic!("Input length {len} is not an even multiple of frame length {frame_len}; check width/height");
    }

    let mut frames_out = 0;
    let pb =
        indicatif::ProgressBar::new(frames_in).with_style(indicatif::ProgressStyle::with_template("encoding at {msg} {elapsed} {wide_bar} {eta}").unwrap());

    let (raw_frame_tx, raw_frame_rx) = std::sync::mpsc::sync_channel::<Frame>(3);
    let (encoded_frame_tx, encoded_frame_rx) = std::sync::mpsc::sync_channel::<av_traits::VideoEncoderOutput<Frame>>(3);
    std::thread::scope(|s| {
        let pb = &pb;
        let before = Instant::now();
        let reader_offsets = plane_offsets.clone();
        std::thread::Builder::new()
            .name("reader".to_owned())
            .spawn_scoped(s, move || {
                let mut reading = Duration::ZERO;
                for _ in 0..frames_in {
                    let pre_read = Instant::now();
                    let mut frame = Frame {
                        data: vec![0; frame_len as usize],
                        plane_offsets: reader_offsets.clone(),
                    };
                    infile.read_exact(&mut frame.data[..]).unwrap();
                    reading += pre_read.elapsed();
                    raw_frame_tx.send(frame).unwrap();
                }
                drop(raw_frame_tx);
                pb.println(format!("read thread: reading={reading:?}"));
            })
            .unwrap();

        std::thread::Builder::new()
            .name("writer".to_owned())
            .spawn_scoped(s, move || {
                let mut writing = Duration::ZERO;
                let mut keyframes = 0;
                while let Ok(frame) = encoded_frame_rx.recv() {
                    let pre_write = Instant::now();
                    outfile.write_all(&frame.encoded_frame.data).unwrap();
                    writing += pre_write.elapsed();
                    if frame.encoded_frame.is_keyframe {
                        keyframes += 1;
                    }
                    pb.inc(1);
                }
                drop(outfile);
                pb.println(format!("write thread: writing={writing:?} keyframes={keyframes}"));
            })
            .unwrap();

        let mut encoding = Duration::ZERO;
        let mut frame_number = 0u64;
        while let Ok(frame) = raw_frame_rx.recv() {
            if Some(frame_number) == args.bitrate_change_at {
                if let Some(new_bitrate) = args.new_bitrate {
                    if let Err(e) = encoder.set_bitrate(new_bitrate) {
                        pb.println(format!("bitrate change failed: {e}"));
                    }
                }
            }
            let frame_type = match args.force_keyframe_interval {
                Some(n) if n > 0 && frame_number % n == 0 => av_traits::EncodedFrameType::Key,
                _ => av_traits::EncodedFrameType::Auto,
            };
            frame_number += 1;

            let pre = Instant::now();
            let output = encoder.encode(frame, frame_type).unwrap();
            encoding += pre.elapsed();
            if let Some(o) = output {
                encoded_frame_tx.send(o).unwrap();
                frames_out += 1;
                pb.set_message(format!("{:.02}x", (frames_out as f64) / f64::from(args.fps) / before.elapsed().as_secs_f64()));
            }
        }
        loop {
            let pre = Instant::now();
            let output = encoder.flush().unwrap();
            encoding += pre.elapsed();
            let Some(output) = output else {
                break;
            };
            encoded_frame_tx.send(output).unwrap();
            frames_out += 1;
        }
        drop(encoded_frame_tx);
        pb.println(format!("encode thread: encoding={encoding:?} total={:?}", before.elapsed()));
    });
    assert_eq!(frames_in, frames_out);
    pb.finish();
}
