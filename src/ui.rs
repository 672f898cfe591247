use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// Plain-mode progress line every this many items.
const PLAIN_REPORT_EVERY: u64 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: &str) -> Self {
        match flag {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Stderr reporting for the offline tools. In auto mode bars and spinners
/// are drawn only when stderr is a terminal.
#[derive(Clone, Copy, Debug)]
pub struct Ui {
    animated: bool,
}

impl Ui {
    pub fn new(mode: UiMode, stderr_is_tty: bool) -> Self {
        Self {
            animated: match mode {
                UiMode::Auto => stderr_is_tty,
                UiMode::Plain => false,
                UiMode::Pretty => true,
            },
        }
    }

    /// A step of unknown length.
    pub fn step(&self, title: &str) -> Step {
        let bar = self.animated.then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        });
        Step::start(title, None, bar)
    }

    /// A step over `total` items; call [`Step::advance`] once per item.
    pub fn counted_step(&self, title: &str, total: u64) -> Step {
        let bar = self.animated.then(|| {
            ProgressBar::new(total).with_style(
                ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            )
        });
        Step::start(title, Some(total), bar)
    }
}

pub struct Step {
    title: String,
    total: Option<u64>,
    done: u64,
    started: Instant,
    bar: Option<ProgressBar>,
}

impl Step {
    fn start(title: &str, total: Option<u64>, bar: Option<ProgressBar>) -> Self {
        match &bar {
            Some(bar) => {
                bar.set_draw_target(ProgressDrawTarget::stderr());
                bar.set_message(title.to_string());
            }
            None => match total {
                Some(total) => eprintln!("==> {} ({} items)", title, total),
                None => eprintln!("==> {}", title),
            },
        }
        Self {
            title: title.to_string(),
            total,
            done: 0,
            started: Instant::now(),
            bar,
        }
    }

    pub fn advance(&mut self) {
        self.done += 1;
        match (&self.bar, self.total) {
            (Some(bar), _) => bar.inc(1),
            (None, Some(total)) if self.done % PLAIN_REPORT_EVERY == 0 => {
                eprintln!("    {}/{}", self.done, total);
            }
            _ => {}
        }
    }
}

impl Drop for Step {
    fn drop(&mut self) {
        let line = format!("done: {} in {:.2?}", self.title, self.started.elapsed());
        match self.bar.take() {
            Some(bar) => bar.finish_with_message(line),
            None => eprintln!("{}", line),
        }
    }
}
