//! Terminal chat client.
//!
//! Peers discover each other over the in-process rendezvous, so this demo
//! is single-process: use `--bots` to spawn extra clients that join the
//! same channel and replicate with you.
//!
//! Type `/help` for the available commands.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use meshchat::{
    commands::{self, Command},
    Client, Event, MemoryRendezvous, Payload, STATUS_CHANNEL,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
struct Args {
    /// Nickname. Random when omitted.
    #[clap(short, long)]
    nick: Option<String>,
    /// Channel to join on startup.
    #[clap(short, long, default_value = "lobby")]
    channel: String,
    /// Number of bot clients to spawn for company.
    #[clap(long, default_value_t = 0)]
    bots: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let rendezvous = Arc::new(MemoryRendezvous::new());
    let mut builder = Client::builder().rendezvous(rendezvous.clone());
    if let Some(nick) = &args.nick {
        builder = builder.user(nick.clone());
    }
    let client = builder.spawn();
    let events = client.subscribe().await?;

    for _ in 0..args.bots {
        spawn_bot(rendezvous.clone(), args.channel.clone());
    }

    for line in commands::MOTD.lines() {
        client.post_status(line).await?;
    }
    client.join(STATUS_CHANNEL).await?;
    client.join(&args.channel).await?;

    tokio::spawn(print_loop(events));

    // stdin is blocking, so read lines on a separate thread
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(1);
    std::thread::spawn(move || input_loop(line_tx));

    let mut current = args.channel.clone();
    while let Some(line) = line_rx.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match commands::parse(line) {
            Command::Join(channel) => {
                let channel = channel.unwrap_or_else(|| current.clone());
                client.join(&channel).await?;
                current = channel;
            }
            Command::Part(channel) => {
                let channel = channel.unwrap_or_else(|| current.clone());
                client.part(&channel).await?;
                if channel == current {
                    current = STATUS_CHANNEL.to_string();
                }
            }
            Command::Nick(name) => {
                client.set_user(&name).await?;
                client.post_status(format!("you are now known as {name}")).await?;
            }
            Command::Help => {
                for line in commands::MOTD.lines() {
                    client.post_status(line).await?;
                }
            }
            Command::Unknown(cmd) => {
                client.post_status(format!("unknown command: /{cmd}")).await?;
            }
            Command::Say(text) => {
                if current == STATUS_CHANNEL {
                    client
                        .post_status("join a channel first, e.g. /join lobby")
                        .await?;
                } else {
                    client.send(&current, text).await?;
                }
            }
        }
    }
    client.shutdown().await?;
    Ok(())
}

async fn print_loop(events: async_channel::Receiver<Event>) {
    while let Ok(event) = events.recv().await {
        match event {
            Event::Join { channel } => println!("* joined {channel}"),
            Event::Part { channel } => println!("* left {channel}"),
            Event::Peer { channel, peer } => {
                println!("* peer {} connected on {channel}", peer.fmt_short())
            }
            Event::Disconnect { channel, peer } => {
                println!("* peer {} disconnected from {channel}", peer.fmt_short())
            }
            Event::Change { channel, entry } => {
                println!("[{channel}] <{}> {}", entry.user, entry.data)
            }
        }
    }
}

fn input_loop(line_tx: tokio::sync::mpsc::Sender<String>) -> Result<()> {
    let mut buffer = String::new();
    let stdin = std::io::stdin();
    loop {
        stdin.read_line(&mut buffer)?;
        line_tx.blocking_send(buffer.clone())?;
        buffer.clear();
    }
}

/// A client that joins the channel, greets, and echoes mentions.
fn spawn_bot(rendezvous: Arc<MemoryRendezvous>, channel: String) {
    tokio::spawn(async move {
        let nick = format!("bot-{}", rand_suffix());
        let bot = Client::builder()
            .user(nick.clone())
            .rendezvous(rendezvous)
            .spawn();
        let events = bot.subscribe().await?;
        bot.join(&channel).await?;
        bot.send(&channel, format!("{nick} reporting in")).await?;
        while let Ok(event) = events.recv().await {
            if let Event::Change { channel, entry } = event {
                if entry.user != nick && mentions(&entry.data, &nick) {
                    bot.send(&channel, format!("{}: you called?", entry.user))
                        .await?;
                }
            }
        }
        anyhow::Ok(())
    });
}

fn mentions(data: &Payload, nick: &str) -> bool {
    match data {
        Payload::Text(text) => text.contains(nick),
        Payload::List(items) => items.iter().any(|item| item.contains(nick)),
    }
}

fn rand_suffix() -> String {
    data_encoding::HEXLOWER.encode(&rand::random::<[u8; 2]>())
}
