use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::broker::Broker;

/// Spawns the periodic reaper. The task holds only a weak handle so a
/// dropped broker winds it down; `Broker::close` aborts it outright.
pub(crate) fn spawn(broker: &Arc<Broker>, period: Duration) -> JoinHandle<()> {
    let broker: Weak<Broker> = Arc::downgrade(broker);

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let _ = ticker.tick().await;
            let Some(broker) = broker.upgrade() else {
                break;
            };
            broker.sweep();
        }
    })
}
