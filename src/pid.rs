//! Finding process IDs on devices whose shells differ wildly: some have
//! `pidof`, some only a `ps` that needs `-A`, some only a bare `ps`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use crate::client::shell_quote;
use crate::parsers::{parse_pid_list, parse_proc_cmdline_pids, parse_ps_pids};
use crate::protocol::AdbError;
use crate::transport::Transport;

/// PID of init, present on every device and used to validate probes
const INIT_PID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidStrategy {
    PidOf,
    PsAll,
    Ps,
    ProcScan,
}

/// Outcome of each capability probe; `None` means not probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResults {
    pub pidof: Option<bool>,
    pub ps_all: Option<bool>,
    pub ps: Option<bool>,
}

/// Most preferred strategy whose probe succeeded
pub fn select_strategy(probes: &ProbeResults) -> PidStrategy {
    if probes.pidof == Some(true) {
        PidStrategy::PidOf
    } else if probes.ps_all == Some(true) {
        PidStrategy::PsAll
    } else if probes.ps == Some(true) {
        PidStrategy::Ps
    } else {
        PidStrategy::ProcScan
    }
}

async fn probe(transport: &dyn Transport, serial: &str, strategy: PidStrategy) -> bool {
    match query(transport, serial, strategy, "init").await {
        Ok(pids) => pids.contains(&INIT_PID),
        Err(e) => {
            log::debug!("[{}] {:?} probe failed: {}", serial, strategy, e);
            false
        }
    }
}

/// Probe capabilities in preference order, stopping at the first that works.
pub async fn detect_strategy(transport: &dyn Transport, serial: &str) -> PidStrategy {
    let mut probes = ProbeResults::default();

    probes.pidof = Some(probe(transport, serial, PidStrategy::PidOf).await);
    if probes.pidof != Some(true) {
        probes.ps_all = Some(probe(transport, serial, PidStrategy::PsAll).await);
        if probes.ps_all != Some(true) {
            probes.ps = Some(probe(transport, serial, PidStrategy::Ps).await);
        }
    }

    let strategy = select_strategy(&probes);
    log::info!("[{}] PID detection strategy: {:?}", serial, strategy);
    strategy
}

/// List PIDs of processes named `name` with one specific strategy
pub async fn query(
    transport: &dyn Transport,
    serial: &str,
    strategy: PidStrategy,
    name: &str,
) -> Result<Vec<u32>, AdbError> {
    let quoted = shell_quote(name);
    let pids = match strategy {
        PidStrategy::PidOf => {
            parse_pid_list(&transport.shell(serial, &format!("pidof {}", quoted)).await?)
        }
        PidStrategy::PsAll => parse_ps_pids(
            &transport.shell(serial, &format!("ps -A | grep {}", quoted)).await?,
            name,
        ),
        PidStrategy::Ps => parse_ps_pids(
            &transport.shell(serial, &format!("ps | grep {}", quoted)).await?,
            name,
        ),
        PidStrategy::ProcScan => parse_proc_cmdline_pids(
            &transport
                .shell(serial, &format!("grep -s -l {} /proc/*/cmdline", quoted))
                .await?,
        ),
    };
    Ok(pids)
}

/// Per-device strategy cache keyed by udid. Each device is probed at most
/// once, even when lookups race.
#[derive(Default)]
pub struct PidDetector {
    strategies: Mutex<HashMap<String, Arc<OnceCell<PidStrategy>>>>,
}

impl PidDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<PidStrategy>>>> {
        match self.strategies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cell(&self, udid: &str) -> Arc<OnceCell<PidStrategy>> {
        self.lock().entry(udid.to_string()).or_default().clone()
    }

    /// Cached strategy for `udid`, if already resolved
    pub fn cached(&self, udid: &str) -> Option<PidStrategy> {
        self.lock().get(udid).and_then(|cell| cell.get().copied())
    }

    pub async fn strategy(&self, transport: &dyn Transport, udid: &str) -> PidStrategy {
        let cell = self.cell(udid);
        let strategy = cell.get_or_init(|| detect_strategy(transport, udid)).await;
        *strategy
    }

    pub async fn get_pid_of(
        &self,
        transport: &dyn Transport,
        udid: &str,
        name: &str,
    ) -> Result<Vec<u32>, AdbError> {
        let strategy = self.strategy(transport, udid).await;
        query(transport, udid, strategy, name).await
    }

    /// Drop the cached strategy of a removed device
    pub fn forget(&self, udid: &str) {
        self.lock().remove(udid);
    }
}
