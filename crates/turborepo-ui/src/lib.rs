//! Terminal output for the task runner.
//!
//! Task output is multiplexed onto one terminal, so everything funnels
//! through prefixed writers (`pkg:task: `) with a stable color per task.
//! This crate carries no execution logic: it renders what it is handed.

mod color_selector;
mod logs;
mod prefixed;

use std::time::Duration;

pub use color_selector::ColorSelector;
use console::{Style, StyledObject};
pub use logs::replay_logs;
pub use prefixed::{PrefixedUI, PrefixedWriter};
use tiny_gradient::{Gradient, GradientStr};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read logs: {0}")]
    CannotReadLogs(#[source] std::io::Error),
    #[error("cannot write logs: {0}")]
    CannotWriteLogs(#[source] std::io::Error),
}

lazy_static::lazy_static! {
    pub static ref GREY: Style = Style::new().dim();
    pub static ref BOLD_GREY: Style = Style::new().dim().bold();
    pub static ref BOLD: Style = Style::new().bold();
    pub static ref BOLD_GREEN: Style = Style::new().green().bold();
    pub static ref BOLD_RED: Style = Style::new().red().bold();
    pub static ref YELLOW: Style = Style::new().yellow();
    pub static ref MAGENTA: Style = Style::new().magenta();
    pub static ref CYAN: Style = Style::new().cyan();
}

/// Whether and how to color output. Carried by value everywhere it's
/// needed rather than consulting globals.
#[derive(Debug, Clone, Copy)]
pub struct ColorConfig {
    pub should_strip_ansi: bool,
}

impl ColorConfig {
    pub fn new(should_strip_ansi: bool) -> Self {
        Self { should_strip_ansi }
    }

    /// Infers color support from the terminal.
    pub fn infer() -> Self {
        Self {
            should_strip_ansi: !console::colors_enabled(),
        }
    }

    pub fn apply(&self, styled: StyledObject<impl std::fmt::Display>) -> String {
        let rendered = styled.to_string();
        if self.should_strip_ansi {
            console::strip_ansi_codes(&rendered).into_owned()
        } else {
            rendered
        }
    }

    /// The celebratory gradient for fully-cached runs.
    pub fn rainbow(&self, text: &str) -> String {
        if self.should_strip_ansi {
            return text.to_string();
        }
        format!("{}", text.gradient(Gradient::Rainbow))
    }
}

pub fn start_spinner(message: &str) -> indicatif::ProgressBar {
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

#[macro_export]
macro_rules! color {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        $color_config.apply($color.apply_to(format!($($args),+)))
    };
}

#[macro_export]
macro_rules! cprint {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        print!("{}", $crate::color!($color_config, $color, $($args),+))
    };
}

#[macro_export]
macro_rules! cprintln {
    ($color_config:expr, $color:expr, $($args:expr),+) => {
        println!("{}", $crate::color!($color_config, $color, $($args),+))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_strip_ansi() {
        let config = ColorConfig::new(true);
        let out = config.apply(BOLD_GREEN.apply_to("ok"));
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_rainbow_stripped_is_plain() {
        let config = ColorConfig::new(true);
        assert_eq!(config.rainbow(">>> FULL TURBO"), ">>> FULL TURBO");
    }
}
