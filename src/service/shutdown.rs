// Copyright 2025 jonefeewang@gmail.com
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

use tokio::sync::broadcast;

/// Listens for the engine-wide shutdown broadcast.
///
/// Each long-lived task (accept loops, outbound workers, monitors) holds its
/// own `Shutdown` and selects on [`recv`](Shutdown::recv). The signal is
/// latched once observed, so later calls return immediately.
#[derive(Debug)]
pub struct Shutdown {
    shutdown_received: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown_received: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_received
    }

    /// Waits for the shutdown signal.
    ///
    /// A closed or lagged broadcast channel counts as shutdown too; the
    /// sender side only ever disappears during teardown.
    pub async fn recv(&mut self) {
        if self.shutdown_received {
            return;
        }
        let _ = self.notify.recv().await;
        self.shutdown_received = true;
    }
}
