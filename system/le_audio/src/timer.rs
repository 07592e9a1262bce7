// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Single shot alarms posting a [`Message`] to the client's queue.

use crate::Message;
use log::warn;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// A cancelable single shot timer. Scheduling it again cancels the pending instance.
#[derive(Debug, Default)]
pub struct Alarm {
    handle: Option<JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `msg` to `tx` after `delay`.
    pub fn schedule(&mut self, delay: Duration, tx: UnboundedSender<Message>, msg: Message) {
        self.cancel();
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No runtime, {:?} won't fire", msg);
                return;
            }
        };
        self.handle = Some(runtime.spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(msg);
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True until the alarm fired or was canceled.
    pub fn is_scheduled(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.schedule(Duration::from_millis(100), tx, Message::SuspendTimeout(1));
        assert!(alarm.is_scheduled());

        time::sleep(Duration::from_millis(99)).await;
        assert!(rx.try_recv().is_err());
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.try_recv(), Ok(Message::SuspendTimeout(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_cancels_pending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.schedule(Duration::from_millis(100), tx.clone(), Message::SuspendTimeout(1));
        alarm.schedule(Duration::from_millis(200), tx, Message::SuspendTimeout(2));

        time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rx.try_recv(), Ok(Message::SuspendTimeout(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.schedule(Duration::from_millis(100), tx, Message::StateTransitionTimeout(3));
        alarm.cancel();
        assert!(!alarm.is_scheduled());
        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_runtime_is_not_fatal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new();
        alarm.schedule(Duration::from_millis(100), tx, Message::SuspendTimeout(1));
        assert!(!alarm.is_scheduled());
    }
}
