use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::dispatch::CommandOutput;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

impl OutputStyle {
    pub(crate) fn current() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Rich
        } else {
            Self::Plain
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LineStatus {
    Step,
    Warn,
    Error,
    Critical,
}

impl LineStatus {
    fn badge(self) -> &'static str {
        match self {
            Self::Step => "[OK]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERR]",
            Self::Critical => "[CRITICAL]",
        }
    }

    fn style(self) -> Style {
        let color = match self {
            Self::Step => AnsiColor::BrightGreen,
            Self::Warn => AnsiColor::BrightYellow,
            Self::Error => AnsiColor::BrightRed,
            Self::Critical => AnsiColor::BrightMagenta,
        };
        Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
    }
}

pub(crate) fn classify_line(line: &str) -> LineStatus {
    if line.starts_with("CRITICAL") {
        LineStatus::Critical
    } else if line.starts_with("error:") {
        LineStatus::Error
    } else if line.starts_with("warning:") || line.contains("Warning:") {
        LineStatus::Warn
    } else {
        LineStatus::Step
    }
}

/// Badged line for `--human` output; colour only applies to the rich style.
pub(crate) fn render_status_line(style: OutputStyle, line: &str) -> String {
    let status = classify_line(line);
    match style {
        OutputStyle::Plain => format!("{} {line}", status.badge()),
        OutputStyle::Rich => format!("{} {line}", colorize(status.style(), status.badge())),
    }
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn print_output(output: &CommandOutput, style: Option<OutputStyle>) -> Result<()> {
    match style {
        None => {
            let rendered = serde_json::to_string_pretty(&output.json)
                .context("failed to render command result")?;
            println!("{rendered}");
        }
        Some(style) => {
            for line in &output.log {
                println!("{}", render_status_line(style, line));
            }
        }
    }
    Ok(())
}

pub(crate) struct ProbeProgress {
    progress_bar: Option<ProgressBar>,
}

impl ProbeProgress {
    pub(crate) fn start(seconds: f64, human: bool) -> Self {
        let enabled =
            human && std::io::stderr().is_terminal() && seconds.is_finite() && seconds > 0.0;
        if !enabled {
            return Self { progress_bar: None };
        }

        let total_ms = (seconds * 1000.0) as u64;
        let progress_bar = ProgressBar::new(total_ms.max(1));
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<6} [{bar:20.cyan/blue}] {elapsed_precise}",
        ) {
            progress_bar.set_style(style.tick_chars(".:;* ").progress_chars("=>-"));
        }
        progress_bar.set_message("probe");
        progress_bar.enable_steady_tick(Duration::from_millis(80));
        Self {
            progress_bar: Some(progress_bar),
        }
    }

    pub(crate) fn set(&mut self, elapsed: Duration) {
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.set_position(elapsed.as_millis() as u64);
        }
    }

    pub(crate) fn finish(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}
