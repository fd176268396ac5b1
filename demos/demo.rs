//! Manual smoke-test binary: connects to a real IMAP server, logs in, and
//! lists the response stream for a handful of commands. Mirrors
//! `source/main.rs`'s `clap`/`log4rs` setup, minus the Maildir/notmuch
//! orchestration that sits outside this crate's scope.

use clap::Parser as _;
use std::time::Duration;

#[derive(clap::Parser)]
struct Arguments {
  #[arg(long, help = "Server hostname")]
  host: String,
  #[arg(long, default_value_t = 993, help = "Server port")]
  port: u16,
  #[arg(long, help = "Connect with TLS from the first octet instead of STARTTLS")]
  implicit_tls: bool,
  #[arg(long, help = "Username")]
  username: String,
  #[arg(long, help = "Password", env = "YMAP_DEMO_PASSWORD")]
  password: String,
  #[arg(long, default_value = "INBOX", help = "Mailbox to SELECT")]
  mailbox: String,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(
    "{d(%F %T)} {l} {t} - {m}{n}",
  ));
  log4rs::init_config(
    log4rs::config::Config::builder()
      .appender(
        log4rs::config::Appender::builder()
          .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
            arguments.verbose.log_level_filter(),
          )))
          .build(
            "console",
            Box::new(
              log4rs::append::console::ConsoleAppender::builder()
                .encoder(encoder)
                .build(),
            ),
          ),
      )
      .build(
        log4rs::config::Root::builder()
          .appenders(["console"])
          .build(log::LevelFilter::Trace),
      )?,
  )?;

  let timeout = Some(Duration::from_secs(30));
  let transport = if arguments.implicit_tls {
    ymap::TcpTransport::connect_tls(&arguments.host, arguments.port, timeout)?
  } else {
    ymap::TcpTransport::connect(&arguments.host, arguments.port, timeout)?
  };

  let client = ymap::Client::connect(transport, Default::default());

  // Greeting.
  println!("{:?}", client.get()?);

  if !arguments.implicit_tls {
    client.cmd_starttls()?;
    drain_until_tagged(&client)?;
  }

  client.cmd_login(&arguments.username, arguments.password.clone())?;
  drain_until_tagged(&client)?;

  client.cmd_select(&arguments.mailbox)?;
  drain_until_tagged(&client)?;

  client.cmd_logout()?;
  drain_until_tagged(&client)?;

  let unsent = client.stop();
  if !unsent.is_empty() {
    log::warn!("{} command(s) never sent", unsent.len());
  }
  Ok(())
}

/// Prints every response until (and including) the next tagged
/// completion — good enough for a manual smoke test, which never has two
/// commands in flight at once.
fn drain_until_tagged(client: &ymap::Client) -> anyhow::Result<()> {
  loop {
    let response = client.get()?;
    let tagged = !matches!(response.tag, ymap::Tag::Untagged);
    println!("{response:?}");
    if tagged {
      return Ok(());
    }
  }
}
