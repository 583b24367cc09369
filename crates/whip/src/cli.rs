use anyhow::Context;
use rtcbridge_core::config::VideoCodec;

pub(crate) struct Args {
    pub url: String,
    pub video_codec: VideoCodec,
    pub bitrate_bps: Option<u32>,
    pub max_keyframe_distance: Option<u32>,
    pub config_path: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut url = String::new();
    let mut video_codec = VideoCodec::Vp8;
    let mut bitrate_bps = None;
    let mut max_keyframe_distance = None;
    let mut config_path = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("rtcbridge-whip {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("rtcbridge-whip - WHIP client, pushes a Matroska stream from stdin");
                println!();
                println!("USAGE:");
                println!("    rtcbridge-whip [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --url <URL>                       WHIP endpoint URL (required)");
                println!("    --video-codec <vp8|vp9>            Negotiated video codec [default: vp8]");
                println!("    --bitrate <KBPS>                   VP8 encoder target bitrate");
                println!("    --max-keyframe-distance <FRAMES>   Max frames between keyframes");
                println!("    --config <PATH>                    TOML config file, overridden by flags above");
                println!("    -V, --version                      Print version and exit");
                println!("    -h, --help                         Print this help and exit");
                std::process::exit(0);
            }
            "--url" => {
                i += 1;
                url = args.get(i).context("Missing --url value")?.clone();
            }
            "--video-codec" => {
                i += 1;
                video_codec = match args.get(i).context("Missing --video-codec value")?.as_str() {
                    "vp8" => VideoCodec::Vp8,
                    "vp9" => VideoCodec::Vp9,
                    other => anyhow::bail!("Invalid --video-codec value: {other} (expected vp8 or vp9)"),
                };
            }
            "--bitrate" => {
                i += 1;
                let kbps: u32 = args
                    .get(i)
                    .context("Missing --bitrate value")?
                    .parse()
                    .context("Invalid --bitrate value")?;
                bitrate_bps = Some(kbps * 1000);
            }
            "--max-keyframe-distance" => {
                i += 1;
                max_keyframe_distance = Some(
                    args.get(i)
                        .context("Missing --max-keyframe-distance value")?
                        .parse()
                        .context("Invalid --max-keyframe-distance value")?,
                );
            }
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        url,
        video_codec,
        bitrate_bps,
        max_keyframe_distance,
        config_path,
    })
}
