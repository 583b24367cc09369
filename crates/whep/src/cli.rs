use anyhow::Context;
use rtcbridge_core::config::VideoCodec;

pub(crate) struct Args {
    pub url: String,
    pub video_codec: VideoCodec,
    pub audio_enabled: bool,
    pub low_res_floor: (u32, u32),
    pub stream_timeout_secs: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub config_path: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut url = String::new();
    let mut video_codec = VideoCodec::Vp8;
    let mut audio_enabled = true;
    let mut low_res_floor: (u32, u32) = (640, 360);
    let mut stream_timeout_secs = None;
    let mut reconnect_attempts = None;
    let mut config_path = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("rtcbridge-whep {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("rtcbridge-whep - WHEP client, muxes a remote stream to Matroska on stdout");
                println!();
                println!("USAGE:");
                println!("    rtcbridge-whep [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --url <URL>                     WHEP endpoint URL (required)");
                println!("    --video-codec <vp8|vp9>          Negotiated video codec [default: vp8]");
                println!("    --audio                          Enable audio track [default]");
                println!("    --no-audio                       Disable audio track");
                println!(
                    "    --low-res-floor <WxH>            Suppress frames below this resolution [default: 640x360]"
                );
                println!("    --stream-timeout-secs <SECS>     Inter-frame silence timeout");
                println!("    --reconnect-attempts <N>         Reconnect attempts before giving up");
                println!("    --config <PATH>                  TOML config file, overridden by flags above");
                println!("    -V, --version                    Print version and exit");
                println!("    -h, --help                       Print this help and exit");
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
            "--audio" => {
                audio_enabled = true;
            }
            "--no-audio" => {
                audio_enabled = false;
            }
            "--low-res-floor" => {
                i += 1;
                let raw = args.get(i).context("Missing --low-res-floor value")?;
                low_res_floor = parse_resolution(raw).context("Invalid --low-res-floor value")?;
            }
            "--stream-timeout-secs" => {
                i += 1;
                stream_timeout_secs = Some(
                    args.get(i)
                        .context("Missing --stream-timeout-secs value")?
                        .parse()
                        .context("Invalid --stream-timeout-secs value")?,
                );
            }
            "--reconnect-attempts" => {
                i += 1;
                reconnect_attempts = Some(
                    args.get(i)
                        .context("Missing --reconnect-attempts value")?
                        .parse()
                        .context("Invalid --reconnect-attempts value")?,
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
        audio_enabled,
        low_res_floor,
        stream_timeout_secs,
        reconnect_attempts,
        config_path,
    })
}

fn parse_resolution(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = raw
        .split_once('x')
        .context("resolution must be WIDTHxHEIGHT, e.g. 640x360")?;
    Ok((w.parse()?, h.parse()?))
}
