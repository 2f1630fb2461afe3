//! Command implementations.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, bail};
use keel_tunnel::{
    CommandOutcome, CommandPolicy, FakeBackend, ManagerConfig, PermissionKind, PermissionRequest,
    StateSubscription, TunnelBackend, TunnelConfiguration, TunnelError, TunnelManager, TunnelState,
    WgQuickBackend, WgQuickConfig, generate_keypair, wgconf,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info};

use crate::cli::{Cli, Commands};
use crate::output::{ConfigSummary, Format, StatusReport};

/// Interactive input and command output.
pub struct Console<R, W> {
    input: Lines<R>,
    out: W,
}

impl<R: AsyncBufRead + Unpin, W: Write> Console<R, W> {
    /// Wraps a line source and an output sink.
    pub fn new(input: R, out: W) -> Self {
        Self {
            input: input.lines(),
            out,
        }
    }

    /// Asks a yes/no question. Anything but `y`/`yes`, including end of
    /// input, is a no.
    async fn ask(&mut self, question: &str) -> anyhow::Result<bool> {
        write!(self.out, "{question} [y/N] ")?;
        self.out.flush()?;
        let answer = self.input.next_line().await?.unwrap_or_default();
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// Runs one parsed command line.
///
/// Fails when the command fails or leaves the tunnel in the error state.
pub async fn run<R, W>(cli: &Cli, console: &mut Console<R, W>) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    match &cli.command {
        Commands::Check { config } => return check(config, &mut console.out),
        Commands::Keygen => return keygen(&mut console.out),
        _ => {}
    }

    let config = ManagerConfig::default()
        .with_tunnel_name(cli.tunnel.clone())
        .with_policy(if cli.reject_busy {
            CommandPolicy::Reject
        } else {
            CommandPolicy::Queue
        });

    if cli.simulate {
        let backend = FakeBackend::new().with_permission_request(PermissionRequest::new(
            PermissionKind::VpnConsent,
            "keel wants to set up a VPN connection that can monitor network traffic.",
        ));
        drive(TunnelManager::new(backend, config)?, &cli.command, console).await
    } else {
        let backend =
            WgQuickBackend::new(WgQuickConfig::default().with_runtime_dir(&cli.runtime_dir));
        drive(TunnelManager::new(backend, config)?, &cli.command, console).await
    }
}

fn load_config(path: &Path) -> anyhow::Result<TunnelConfiguration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    wgconf::parse(&text).with_context(|| format!("invalid configuration in {}", path.display()))
}

fn check<W: Write>(path: &Path, out: &mut W) -> anyhow::Result<()> {
    let config = load_config(path)?;
    Format::Text.write(out, &ConfigSummary::from(&config))
}

fn keygen<W: Write>(out: &mut W) -> anyhow::Result<()> {
    let (private, public) = generate_keypair();
    writeln!(out, "PrivateKey = {}", private.to_base64())?;
    writeln!(out, "PublicKey = {}", public.to_base64())?;
    Ok(())
}

async fn drive<B, R, W>(
    manager: TunnelManager<B>,
    command: &Commands,
    console: &mut Console<R, W>,
) -> anyhow::Result<()>
where
    B: TunnelBackend,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    manager.refresh().await?;
    debug!(tunnel = %manager.tunnel_id(), state = %manager.current_state(), "initial state");

    match command {
        Commands::Up { config } => {
            let config = load_config(config)?;
            let outcome = manager.connect(config).await?;
            let state = settle(&manager, outcome, console).await?;
            writeln!(console.out, "{}: {state}", manager.tunnel_id())?;
        }
        Commands::Down => {
            let state = manager.disconnect().await?.state().cloned().unwrap_or_default();
            writeln!(console.out, "{}: {state}", manager.tunnel_id())?;
        }
        Commands::Status { json } => {
            let report = StatusReport {
                tunnel: manager.tunnel_id().to_string(),
                status: manager.current_state(),
            };
            Format::from_flag(*json).write(&mut console.out, &report)?;
        }
        Commands::Session { config } => {
            let config = load_config(config)?;
            session(&manager, &config, console).await?;
        }
        Commands::Check { .. } | Commands::Keygen => {}
    }

    match manager.current_state() {
        TunnelState::Error(reason) => bail!("tunnel {} failed: {reason}", manager.tunnel_id()),
        _ => Ok(()),
    }
}

/// Answers a permission request, if any, and returns the resulting state.
async fn settle<B, R, W>(
    manager: &TunnelManager<B>,
    outcome: CommandOutcome,
    console: &mut Console<R, W>,
) -> anyhow::Result<TunnelState>
where
    B: TunnelBackend,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let CommandOutcome::PermissionRequired(request) = outcome else {
        return Ok(manager.current_state());
    };

    let granted = console.ask(&request.rationale).await?;
    info!(kind = ?request.kind, granted, "permission answered");
    manager.on_permission_result(granted).await?;
    Ok(manager.current_state())
}

async fn session<B, R, W>(
    manager: &TunnelManager<B>,
    config: &TunnelConfiguration,
    console: &mut Console<R, W>,
) -> anyhow::Result<()>
where
    B: TunnelBackend,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut states = manager.subscribe();
    writeln!(console.out, "commands: up, down, toggle, status, quit")?;
    report_states(&mut states, &mut console.out)?;

    while let Some(line) = console.input.next_line().await? {
        let result = match line.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "status" => {
                writeln!(console.out, "{}: {}", manager.tunnel_id(), manager.current_state())?;
                continue;
            }
            "up" => manager.connect(config.clone()).await,
            "down" => manager.disconnect().await,
            "toggle" => manager.toggle().await,
            other => {
                writeln!(console.out, "unknown command: {other}")?;
                continue;
            }
        };

        match result {
            Ok(outcome) => match settle(manager, outcome, console).await {
                Ok(_) => {}
                Err(err) if is_denied(&err) => writeln!(console.out, "permission denied")?,
                Err(err) => return Err(err),
            },
            Err(TunnelError::Busy) => writeln!(console.out, "busy, try again")?,
            Err(err) => writeln!(console.out, "error: {err}")?,
        }
        report_states(&mut states, &mut console.out)?;
    }

    Ok(())
}

/// Writes every state published since the last call.
fn report_states<W: Write>(states: &mut StateSubscription, out: &mut W) -> anyhow::Result<()> {
    while let Some(state) = states.try_next() {
        writeln!(out, "state: {state}")?;
    }
    Ok(())
}

fn is_denied(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TunnelError>(), Some(TunnelError::PermissionDenied))
}
