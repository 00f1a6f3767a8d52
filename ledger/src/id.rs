use std::sync::{Arc, Mutex};

use uuid::{ContextV7, Timestamp as UuidTimestamp, Uuid};

use crate::time::TimeSource;

/// Generator for event, transaction, and account ids.
///
/// Ids are UUIDv7: a millisecond timestamp prefix followed by counter bits
/// from a shared [`ContextV7`], so ids produced by one generator are
/// strictly increasing even within the same millisecond. Byte order equals
/// creation order, which makes `id < cursor` comparisons in SQL page
/// backwards through insertion time.
#[derive(Clone)]
pub struct IdGenerator {
    context: Arc<Mutex<ContextV7>>,
    time_source: TimeSource,
}

impl IdGenerator {
    pub fn new(time_source: TimeSource) -> Self {
        Self {
            context: Arc::new(Mutex::new(ContextV7::new())),
            time_source,
        }
    }

    pub fn next_id(&self) -> Uuid {
        let now = self.time_source.now();
        let context = self.context.lock().unwrap();
        let ts = UuidTimestamp::from_unix(
            &*context,
            now.as_second().max(0) as u64,
            now.subsec_nanosecond().unsigned_abs(),
        );
        Uuid::new_v7(ts)
    }
}
