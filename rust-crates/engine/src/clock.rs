use chrono::Utc;

/// Source of wall-clock epoch seconds used to turn remote timestamps into a
/// remaining time.
pub trait WallClock: Send + Sync + 'static {
    fn now_epoch(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_epoch(&self) -> u64 {
        u64::try_from(Utc::now().timestamp()).unwrap_or_default()
    }
}
