//! IdGenerator port - ID 生成の抽象化
//!
//! `UlidGenerator` は `Clock` から timestamp を取るため、`FixedClock` を使うと
//! ID の時刻部分が決定的になります。
//!
//! # 単調性
//! 同じミリ秒内（または時計が戻った場合）は乱数を引き直さず、直前の ID を
//! インクリメントします。生成順と ID の順序は常に一致します。

use std::sync::{Arc, Mutex};

use ulid::Ulid;

use crate::domain::ids::{CronJobId, PacketId, TaskId};
use crate::ports::Clock;

/// IdGenerator は各種 ID を生成
///
/// `Send + Sync` を要求（複数タスクから共有される）
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn cron_job_id(&self) -> CronJobId;
    fn packet_id(&self) -> PacketId;
}

/// UlidGenerator は Clock ベースの単調な ULID 生成器
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
    last: Mutex<Ulid>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last: Mutex::new(Ulid::nil()),
        }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let incremented = if last.timestamp_ms() >= timestamp_ms {
            last.increment()
        } else {
            None
        };
        let next = incremented.unwrap_or_else(|| Ulid::from_parts(timestamp_ms, rand::random()));
        *last = next;
        next
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn cron_job_id(&self) -> CronJobId {
        CronJobId::from(self.next())
    }

    fn packet_id(&self) -> PacketId {
        PacketId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));
        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_pins_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        assert_ne!(id1, id2);

        let timestamp1 = (id1.as_ulid().0 >> 80) as u64;
        let timestamp2 = (id2.as_ulid().0 >> 80) as u64;
        assert_eq!(timestamp1, timestamp2);
        assert_eq!(timestamp1, fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn ids_within_one_millisecond_are_strictly_increasing() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let ids: Vec<TaskId> = (0..500).map(|_| id_gen.task_id()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn ids_stay_increasing_when_the_clock_steps_back() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()));
        let id_gen = UlidGenerator::new(clock.clone());

        let first = id_gen.packet_id();
        clock.advance(chrono::Duration::seconds(-5));
        let second = id_gen.packet_id();
        assert!(first < second);
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));
        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.cron_job_id().to_string().starts_with("cron-"));
        assert!(id_gen.packet_id().to_string().starts_with("pkt-"));
    }
}
