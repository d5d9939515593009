// src/console.rs - Line-oriented operator console
//
// Temperatures typed at the console and printed back are in the display unit;
// the controller itself always works in Celsius.
use std::io::BufRead;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::controller::{ControlContext, ControlError};
use crate::pid::PidGains;
use crate::units::TemperatureUnit;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Status,
    Setpoint(f64),
    Gains(PidGains),
    Shutdown,
    AutotuneStart(f64),
    AutotuneCancel,
    AutotuneResult,
    AutotuneApply,
    ProbeEnabled { label: String, enabled: bool },
    History { minutes: u32 },
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
}

const HELP: &str = "\
commands:
  status                         show controller status (JSON)
  setpoint <temp>                set target temperature (re-arms after shutdown)
  gains <kp> <ki> <kd>           set PID gains
  shutdown                       emergency shutdown
  autotune <temp>|cancel|result|apply
  probe enable|disable <label>
  history <minutes>              recorded samples
  quit";

fn number(token: Option<&str>, usage: &'static str) -> Result<f64, ParseError> {
    let token = token.ok_or(ParseError::Usage(usage))?;
    match token.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber(token.to_string())),
    }
}

pub fn parse_command(line: &str) -> Result<OperatorCommand, ParseError> {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Err(ParseError::Empty);
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "status" => OperatorCommand::Status,
        "setpoint" | "set" => OperatorCommand::Setpoint(number(tokens.next(), "setpoint <temp>")?),
        "gains" => {
            const USAGE: &str = "gains <kp> <ki> <kd>";
            let kp = number(tokens.next(), USAGE)?;
            let ki = number(tokens.next(), USAGE)?;
            let kd = number(tokens.next(), USAGE)?;
            OperatorCommand::Gains(PidGains::new(kp, ki, kd))
        }
        "shutdown" | "stop" => OperatorCommand::Shutdown,
        "autotune" => {
            const USAGE: &str = "autotune <temp>|cancel|result|apply";
            match tokens.next().map(str::to_ascii_lowercase).as_deref() {
                Some("cancel") => OperatorCommand::AutotuneCancel,
                Some("result") => OperatorCommand::AutotuneResult,
                Some("apply") => OperatorCommand::AutotuneApply,
                other => OperatorCommand::AutotuneStart(number(other, USAGE)?),
            }
        }
        "probe" => {
            const USAGE: &str = "probe enable|disable <label>";
            let enabled = match tokens.next().map(str::to_ascii_lowercase).as_deref() {
                Some("enable") => true,
                Some("disable") => false,
                _ => return Err(ParseError::Usage(USAGE)),
            };
            let label = tokens.next().ok_or(ParseError::Usage(USAGE))?;
            OperatorCommand::ProbeEnabled {
                label: label.to_string(),
                enabled,
            }
        }
        "history" => {
            let token = tokens.next().unwrap_or("10");
            let minutes = token
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidNumber(token.to_string()))?;
            OperatorCommand::History { minutes }
        }
        "help" | "?" => OperatorCommand::Help,
        "quit" | "exit" => OperatorCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };

    if tokens.next().is_some() {
        return Err(ParseError::Usage("too many arguments"));
    }
    Ok(command)
}

pub struct Console {
    ctx: Arc<ControlContext>,
    unit: TemperatureUnit,
}

impl Console {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        let unit = ctx.settings().display_unit;
        Self { ctx, unit }
    }

    /// Execute one command and return the text to print.
    pub async fn execute(&self, command: OperatorCommand) -> Result<String, ControlError> {
        let unit = self.unit;
        let symbol = unit.symbol();
        match command {
            OperatorCommand::Status => {
                let status = self.ctx.get_status().await.in_unit(unit);
                serde_json::to_string_pretty(&status)
                    .map_err(|e| ControlError::InvalidCommand(format!("status encoding failed: {}", e)))
            }
            OperatorCommand::Setpoint(value) => {
                self.ctx.set_setpoint(unit.to_celsius(value)).await?;
                Ok(format!("setpoint {:.1}{}", value, symbol))
            }
            OperatorCommand::Gains(gains) => {
                self.ctx.set_gains(gains).await?;
                Ok(format!("gains Kp={} Ki={} Kd={}", gains.kp, gains.ki, gains.kd))
            }
            OperatorCommand::Shutdown => {
                self.ctx.emergency_shutdown().await?;
                Ok("EMERGENCY SHUTDOWN latched; set a setpoint to re-arm".to_string())
            }
            OperatorCommand::AutotuneStart(target) => {
                self.ctx.start_autotune(unit.to_celsius(target)).await?;
                Ok(format!("autotune started at {:.1}{}", target, symbol))
            }
            OperatorCommand::AutotuneCancel => {
                self.ctx.cancel_autotune().await;
                Ok("autotune cancelled".to_string())
            }
            OperatorCommand::AutotuneResult => {
                let gains = self.ctx.get_autotune_result().await?;
                Ok(format!("autotune result Kp={:.4} Ki={:.4} Kd={:.4}", gains.kp, gains.ki, gains.kd))
            }
            OperatorCommand::AutotuneApply => {
                let gains = self.ctx.apply_autotune_result().await?;
                Ok(format!("applied Kp={:.4} Ki={:.4} Kd={:.4}", gains.kp, gains.ki, gains.kd))
            }
            OperatorCommand::ProbeEnabled { label, enabled } => {
                self.ctx.set_probe_enabled(&label, enabled).await?;
                Ok(format!("probe {} {}", label, if enabled { "enabled" } else { "disabled" }))
            }
            OperatorCommand::History { minutes } => {
                let since = self.ctx.clock().now_wallclock() - chrono::TimeDelta::minutes(i64::from(minutes));
                let samples = self.ctx.recent_samples(since);
                let mut out = format!("{} samples in the last {} min", samples.len(), minutes);
                for sample in samples {
                    out.push_str(&format!(
                        "\n{} {:<12} {:.1}{}",
                        sample.timestamp.format("%H:%M:%S"),
                        sample.source,
                        unit.from_celsius(sample.value),
                        symbol
                    ));
                }
                Ok(out)
            }
            OperatorCommand::Help => Ok(HELP.to_string()),
            OperatorCommand::Quit => Ok("bye".to_string()),
        }
    }

    /// Read commands until the input closes, `quit`, or shutdown. `quit`
    /// broadcasts shutdown.
    pub async fn run(self, mut input: mpsc::Receiver<String>, shutdown_tx: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tracing::info!("Operator console ready (type 'help')");

        loop {
            let line = tokio::select! {
                _ = shutdown_rx.recv() => break,
                line = input.recv() => line,
            };
            let Some(line) = line else {
                tracing::info!("Console input closed");
                break;
            };

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(ParseError::Empty) => continue,
                Err(e) => {
                    println!("error: {}", e);
                    continue;
                }
            };
            let quit = command == OperatorCommand::Quit;
            match self.execute(command).await {
                Ok(text) => println!("{}", text),
                Err(e) => println!("error: {}", e),
            }
            if quit {
                let _ = shutdown_tx.send(());
                break;
            }
        }
    }
}

/// Read stdin lines on a plain OS thread and forward them to the console.
///
/// The thread is not joined; a read still blocked at exit is abandoned.
pub fn spawn_stdin_reader(capacity: usize) -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Console read error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}
