use anyhow::Context;
use huddle_protocol::ParticipantId;

pub(crate) struct Args {
    pub room_id: String,
    pub user_id: ParticipantId,
    pub server_url: Option<String>,
    pub config_path: Option<String>,
    pub tls_cert_path: Option<String>,
    pub facing: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut room_id = None;
    let mut user_id = None;
    let mut server_url = None;
    let mut config_path = None;
    let mut tls_cert_path = None;
    let mut facing = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("huddle-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("huddle-client - Multi-party call client");
                println!();
                println!("USAGE:");
                println!("    huddle-client --room <ROOM> --user-id <ID> [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --room <ROOM>                Room identifier (required)");
                println!("    --user-id <ID>               Numeric participant id (required)");
                println!("    --server-url <URL>           Relay WebSocket base URL");
                println!("    --config <PATH>              Config file [default: huddle.toml if present]");
                println!(
                    "    --tls-cert <PATH>            TLS certificate to pin for the relay connection"
                );
                println!("    --facing <user|environment>  Initial camera facing [default: user]");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "--room" => {
                i += 1;
                room_id = Some(args.get(i).context("Missing --room value")?.clone());
            }
            "--user-id" => {
                i += 1;
                user_id = Some(ParticipantId(
                    args.get(i)
                        .context("Missing --user-id value")?
                        .parse()
                        .context("Invalid --user-id value")?,
                ));
            }
            "--server-url" => {
                i += 1;
                server_url = Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("Missing --tls-cert value")?.clone());
            }
            "--facing" => {
                i += 1;
                facing = Some(args.get(i).context("Missing --facing value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        room_id: room_id.context("--room is required")?,
        user_id: user_id.context("--user-id is required")?,
        server_url,
        config_path,
        tls_cert_path,
        facing,
    })
}
