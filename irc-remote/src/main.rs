use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use irc_remote::collab::{LogSink, NickIdentity, SequentialIpv6Allocator};
use irc_remote::config::RemoteConfig;
use irc_remote::session::{BridgeUser, SessionCollaborators};
use irc_remote::{ClientConfig, ClientSession, ConnectionBroker, IrcServer};

/// Prime against a remote IRC connection service and optionally drive one session.
#[derive(Debug, Parser)]
#[command(name = "irc-remote", version)]
struct Cli {
    #[command(flatten)]
    remote: RemoteConfig,

    /// Server domain to prime (repeatable).
    #[arg(long = "server", required = true)]
    servers: Vec<String>,

    /// Port passed to the service for new connections.
    #[arg(long, default_value_t = 6697)]
    port: u16,

    /// Connect over TLS.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    tls: bool,

    /// Connect one session with this nick on the first server.
    #[arg(long)]
    nick: Option<String>,

    /// Bridged user id for the session.
    #[arg(long)]
    user_id: Option<String>,

    /// Channel to join once connected (repeatable).
    #[arg(long = "join")]
    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with IRC_REMOTE_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("IRC_REMOTE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("irc_remote=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let servers: Vec<Arc<IrcServer>> = cli
        .servers
        .iter()
        .map(|domain| {
            let mut server = IrcServer::new(domain.as_str());
            server.port = cli.port;
            server.tls = cli.tls;
            Arc::new(server)
        })
        .collect();

    let broker = Arc::new(ConnectionBroker::new(cli.remote.clone())?);
    broker
        .prime(&servers)
        .await
        .context("priming remote connection broker")?;

    for server in &servers {
        let records = broker.connections(&server.domain);
        println!("{} ({} connections)", server.domain, records.len());
        for record in records {
            println!("  {:<20} {}", record.nick, record.id);
        }
    }

    let Some(nick) = cli.nick else {
        broker.close().await;
        return Ok(());
    };

    let collab = SessionCollaborators {
        identity: Arc::new(NickIdentity),
        addresses: Arc::new(SequentialIpv6Allocator::new()),
        events: Arc::new(LogSink),
    };
    let config = ClientConfig {
        desired_nick: Some(nick),
        ..Default::default()
    };
    let user = cli.user_id.map(|id| BridgeUser::new(id, None));
    let server = servers.first().context("no server given")?.clone();
    let mut session = ClientSession::new(broker.clone(), server, config, user, false, collab);

    let id = session.connect().await.context("connecting session")?;
    println!("{} connected as {id}", session.label());

    for channel in &cli.channels {
        session.join_channel(channel, None)?;
    }
    broker.close().await;
    Ok(())
}
