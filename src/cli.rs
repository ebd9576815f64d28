use std::env;
use std::path::PathBuf;

pub const DEFAULT_IMG_FOLDER: &str = "cam";

pub enum Command {
    Help,
    Capture(Config),
}

#[derive(Debug, PartialEq, Eq)]
pub struct Config {
    pub stream_uri: String,
    pub img_folder: PathBuf,
    pub max_frames: Option<u64>,
    pub diagnostics_every: Option<u64>,
}

pub fn parse_args() -> anyhow::Result<Command> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse(&args, |key| env::var(key).ok())
}

/// Parse command-line arguments, falling back to `STREAM_URI` / `IMG_FOLDER`
/// from `env` for anything not given on the command line.
pub fn parse(args: &[String], env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Command> {
    let mut stream_uri = None;
    let mut img_folder = None;
    let mut max_frames = None;
    let mut diagnostics_every = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--uri" => stream_uri = Some(value_of(arg, iter.next())?.clone()),
            "--out" => img_folder = Some(PathBuf::from(value_of(arg, iter.next())?)),
            "--max-frames" => max_frames = Some(parse_count(arg, value_of(arg, iter.next())?)?),
            "--diagnostics" => {
                diagnostics_every = Some(parse_count(arg, value_of(arg, iter.next())?)?)
            }
            other if other.starts_with('-') => {
                anyhow::bail!("Unknown argument '{}'. Use --help for usage.", other);
            }
            uri => {
                if stream_uri.is_some() {
                    anyhow::bail!(
                        "Unexpected extra argument '{}'. Only one stream URI is accepted.",
                        uri
                    );
                }
                stream_uri = Some(uri.to_string());
            }
        }
    }

    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let stream_uri = stream_uri
        .or_else(|| non_empty("STREAM_URI"))
        .filter(|uri| !uri.trim().is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!("No stream URI given. Pass it as an argument or set STREAM_URI.")
        })?;

    let img_folder = img_folder
        .or_else(|| non_empty("IMG_FOLDER").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_IMG_FOLDER));

    Ok(Command::Capture(Config {
        stream_uri,
        img_folder,
        max_frames,
        diagnostics_every,
    }))
}

fn value_of<'a>(flag: &str, value: Option<&'a String>) -> anyhow::Result<&'a String> {
    value.ok_or_else(|| anyhow::anyhow!("{} requires a value.", flag))
}

fn parse_count(flag: &str, value: &str) -> anyhow::Result<u64> {
    let n: u64 = value.parse().map_err(|_| {
        anyhow::anyhow!(
            "Invalid value '{}' for {}. Expected a positive integer.",
            value,
            flag
        )
    })?;
    if n == 0 {
        anyhow::bail!("{} must be >= 1.", flag);
    }
    Ok(n)
}

pub fn print_usage() {
    eprintln!("stream2img - Live stream snapshot tool");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    stream2img [URI] [--out DIR] [--max-frames N] [--diagnostics N]");
    eprintln!("        Decode the stream and save every frame as <epoch-ms>.jpg and <epoch-ms>.bmp");
    eprintln!();
    eprintln!("    stream2img --help");
    eprintln!("        Show this help");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    URI               Stream or file to open (also --uri URI). Default: $STREAM_URI");
    eprintln!(
        "    --out DIR         Output folder, created if missing. Default: $IMG_FOLDER or '{}'",
        DEFAULT_IMG_FOLDER
    );
    eprintln!("    --max-frames N    Stop after N decoded frames");
    eprintln!("    --diagnostics N   Log process memory/status every N frames");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    RUST_LOG          Log filter (default: info)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    stream2img rtsp://192.168.1.10:554/stream1");
    eprintln!("    STREAM_URI=rtsp://cam/live IMG_FOLDER=/tmp/cam stream2img");
    eprintln!("    stream2img input.mp4 --out frames --max-frames 100");
    eprintln!("    stream2img /dev/video0 --diagnostics 250");
}
