//! Presentation contract between the engines and whatever draws them.
//!
//! Engines hand fully computed views to a presenter; presenters never read
//! engine state themselves and are only ever called from the presentation
//! context.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Rgb(pub u32);

impl Rgb {
    pub const BUTTON_ON: Rgb = Rgb(0x00C000);
    pub const BUTTON_OFF: Rgb = Rgb(0xC00000);
    pub const BAR_GREEN: Rgb = Rgb(0x00FF00);
    pub const BAR_AMBER: Rgb = Rgb(0xFFFF00);
    pub const BAR_RED: Rgb = Rgb(0xFF0000);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressBand {
    Green,
    Amber,
    Red,
}

impl ProgressBand {
    pub fn from_remaining_percent(remaining_percent: u32) -> Self {
        if remaining_percent > 50 {
            Self::Green
        } else if remaining_percent > 20 {
            Self::Amber
        } else {
            Self::Red
        }
    }

    pub fn color(self) -> Rgb {
        match self {
            Self::Green => Rgb::BAR_GREEN,
            Self::Amber => Rgb::BAR_AMBER,
            Self::Red => Rgb::BAR_RED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountdownView {
    pub text: String,
    #[serde(rename = "progressPercent")]
    pub progress_percent: u8,
    pub band: ProgressBand,
    #[serde(rename = "progressColor")]
    pub progress_color: Rgb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayView {
    #[serde(rename = "labelText")]
    pub label_text: String,
    #[serde(rename = "primaryColor")]
    pub primary_color: Rgb,
    /// `None` hides the countdown label and progress bar entirely.
    pub countdown: Option<CountdownView>,
}

impl RelayView {
    pub fn build(name: &str, on: bool, time_remaining: u32, duration: u32) -> Self {
        let display_name = if name.trim().is_empty() { "RELAY" } else { name };
        let (label_text, primary_color) = if on {
            (format!("{display_name} ON"), Rgb::BUTTON_ON)
        } else {
            (format!("{display_name} OFF"), Rgb::BUTTON_OFF)
        };

        let countdown = (on && time_remaining > 0).then(|| {
            let progress_percent = progress_percent(time_remaining, duration);
            let band = ProgressBand::from_remaining_percent(100 - u32::from(progress_percent));
            CountdownView {
                text: format_mm_ss(time_remaining),
                progress_percent,
                band,
                progress_color: band.color(),
            }
        });

        Self {
            label_text,
            primary_color,
            countdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterView {
    #[serde(rename = "labelText")]
    pub label_text: &'static str,
    #[serde(rename = "primaryColor")]
    pub primary_color: Rgb,
}

impl MasterView {
    pub fn build(any_on: bool) -> Self {
        if any_on {
            Self {
                label_text: "Master ON",
                primary_color: Rgb::BUTTON_ON,
            }
        } else {
            Self {
                label_text: "Master OFF",
                primary_color: Rgb::BUTTON_OFF,
            }
        }
    }
}

/// Elapsed share of the countdown, floored, clamped to 0..=100.
pub fn progress_percent(time_remaining: u32, duration: u32) -> u8 {
    if duration == 0 {
        return 100;
    }
    let remaining = u64::from(time_remaining.min(duration));
    let elapsed = u64::from(duration) - remaining;
    ((elapsed * 100) / u64::from(duration)).min(100) as u8
}

pub fn format_mm_ss(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

pub trait RelayPresenter: Send + Sync {
    fn render(&self, view: &RelayView);

    /// Drops the widgets backing this relay. Called once, on engine teardown.
    fn release(&self) {}
}

pub trait MasterPresenter: Send + Sync {
    fn render(&self, view: &MasterView);
}

/// Presenter for headless engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl RelayPresenter for NullPresenter {
    fn render(&self, _view: &RelayView) {}
}

impl MasterPresenter for NullPresenter {
    fn render(&self, _view: &MasterView) {}
}
