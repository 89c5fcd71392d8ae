use crate::entry::effective_period;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Текущее unix-время в секундах.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Сколько секунд осталось до конца текущего окна. Всегда в [1, period]:
/// на границе окна остаток равен полному периоду, а не нулю.
pub fn seconds_remaining(period: u32) -> u32 {
    seconds_remaining_at(now_unix(), period)
}

/// То же для конкретного момента времени.
pub fn seconds_remaining_at(unix_seconds: u64, period: u32) -> u32 {
    let period = u64::from(effective_period(period));
    (period - unix_seconds % period) as u32
}

/// Снимок отсчёта на момент тика. Нигде не хранится, каждый раз
/// выводится из часов заново.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownState {
    pub period: u32,
    pub seconds_remaining: u32,
}

impl CountdownState {
    pub fn capture(period: u32) -> Self {
        let period = effective_period(period);
        Self {
            period,
            seconds_remaining: seconds_remaining(period),
        }
    }
}

/// Классификация тика: `Bootstrap` и `Rollover` требуют перегенерации
/// кодов, `Countdown` обновляет только отсчёт.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Bootstrap,
    Rollover,
    Countdown,
}

#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub kind: TickKind,
    pub state: CountdownState,
}

impl Tick {
    /// Нужно ли по этому тику пересчитывать коды.
    pub fn regenerates(&self) -> bool {
        matches!(self.kind, TickKind::Bootstrap | TickKind::Rollover)
    }
}

/// Детектор перехода окна. Переход виден как скачок остатка вверх
/// (1 -> 30); само первое наблюдение тоже считается триггером.
/// Убывающий остаток триггером не считается никогда.
#[derive(Debug, Default)]
pub struct RolloverDetector {
    last: Option<u32>,
}

impl RolloverDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seconds_remaining: u32) -> TickKind {
        let kind = match self.last {
            None => TickKind::Bootstrap,
            Some(prev) if seconds_remaining > prev => TickKind::Rollover,
            Some(_) => TickKind::Countdown,
        };
        self.last = Some(seconds_remaining);
        kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Планировщик отсчёта: один фоновый таймер на один `start`.
///
/// Первый тик уходит немедленно, дальше раз в секунду. Колбэк зовётся
/// под замком фазы, и `stop` берёт тот же замок, поэтому после
/// возврата из `stop` ни один тик уже не долетит.
pub struct CountdownScheduler {
    phase: Arc<Mutex<Phase>>,
    handle: Option<JoinHandle<()>>,
}

impl CountdownScheduler {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(Phase::Idle)),
            handle: None,
        }
    }

    /// Запустить отсчёт. Повторный вызов игнорируется: таймер всегда
    /// ровно один.
    pub fn start<F>(&mut self, period: u32, mut on_tick: F)
    where
        F: FnMut(Tick) + Send + 'static,
    {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Idle {
                warn!("countdown start ignored: scheduler already used");
                return;
            }
            *phase = Phase::Running;
        }

        let period = effective_period(period);
        let phase = Arc::clone(&self.phase);
        self.handle = Some(tokio::spawn(async move {
            let mut detector = RolloverDetector::new();
            loop {
                {
                    let guard = phase.lock();
                    if *guard != Phase::Running {
                        break;
                    }
                    let state = CountdownState::capture(period);
                    let kind = detector.observe(state.seconds_remaining);
                    trace!(remaining = state.seconds_remaining, ?kind, "countdown tick");
                    on_tick(Tick { kind, state });
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }));
    }

    /// Снять таймер. Идемпотентен.
    pub fn stop(&mut self) {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return;
            }
            *phase = Phase::Stopped;
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("countdown scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.phase.lock() == Phase::Running
    }
}

impl Default for CountdownScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CountdownScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[test]
    fn remaining_stays_inside_window() {
        for period in [1u32, 2, 5, 30, 60, 3600] {
            for t in 0u64..200 {
                let left = seconds_remaining_at(t, period);
                assert!(
                    left >= 1 && left <= period,
                    "period {period}, t {t} gave {left}"
                );
            }
        }
    }

    #[test]
    fn window_boundary_reports_full_period() {
        assert_eq!(seconds_remaining_at(0, 30), 30);
        assert_eq!(seconds_remaining_at(30, 30), 30);
        assert_eq!(seconds_remaining_at(90, 30), 30);
        assert_eq!(seconds_remaining_at(29, 30), 1);
        assert_eq!(seconds_remaining_at(31, 30), 29);
    }

    #[test]
    fn zero_period_does_not_divide_by_zero() {
        assert_eq!(seconds_remaining_at(0, 0), 30);
        assert_eq!(seconds_remaining_at(45, 0), 15);
    }

    #[test]
    fn detector_fires_exactly_once_per_rollover() {
        let mut detector = RolloverDetector::new();
        let mut regenerations = 0;

        // Полное окно сверху вниз, затем скачок обратно на 30.
        for remaining in (1..=30).rev() {
            if matches!(
                detector.observe(remaining),
                TickKind::Bootstrap | TickKind::Rollover
            ) {
                regenerations += 1;
            }
        }
        assert_eq!(regenerations, 1, "only the first sample triggers");

        assert_eq!(detector.observe(30), TickKind::Rollover);
        assert_eq!(detector.observe(29), TickKind::Countdown);
    }

    #[test]
    fn first_sample_triggers_regardless_of_magnitude() {
        for first in [1u32, 7, 15, 30] {
            let mut detector = RolloverDetector::new();
            assert_eq!(detector.observe(first), TickKind::Bootstrap);
        }
    }

    #[test]
    fn equal_samples_do_not_retrigger() {
        let mut detector = RolloverDetector::new();
        detector.observe(12);
        assert_eq!(detector.observe(12), TickKind::Countdown);
    }

    #[tokio::test]
    async fn start_emits_an_immediate_bootstrap_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = CountdownScheduler::new();
        scheduler.start(30, move |tick| {
            let _ = tx.send(tick);
        });

        let tick = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("first tick should arrive right away")
            .unwrap();
        assert_eq!(tick.kind, TickKind::Bootstrap);
        assert!(tick.state.seconds_remaining >= 1 && tick.state.seconds_remaining <= 30);
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_silences_the_timer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);

        let mut scheduler = CountdownScheduler::new();
        scheduler.start(30, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hits.load(Ordering::SeqCst) >= 1);

        scheduler.stop();
        let after_stop = hits.load(Ordering::SeqCst);
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after_stop);

        scheduler.stop(); // повторный stop ничего не делает
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut scheduler = CountdownScheduler::new();
        let hits = Arc::clone(&first);
        scheduler.start(30, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = Arc::clone(&second);
        scheduler.start(30, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop();

        assert!(first.load(Ordering::SeqCst) >= 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn short_period_rolls_over_and_regenerates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = CountdownScheduler::new();
        scheduler.start(2, move |tick| {
            let _ = tx.send(tick.kind);
        });

        // За четыре секундных тика двухсекундное окно обязано перейти.
        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            let kind = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("ticks should keep coming")
                .unwrap();
            kinds.push(kind);
        }
        scheduler.stop();

        assert_eq!(kinds[0], TickKind::Bootstrap);
        assert!(
            kinds[1..].contains(&TickKind::Rollover),
            "no rollover in {kinds:?}"
        );
    }
}
