use tracing::{error, info};

use crate::driver::{DriverHandle, NetworkDriver};

/// Boot sequence position. Exactly one is current; `Active` and `Error`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringupState {
    IdentityInit,
    DriverInit,
    DriverReady,
    DriverOpen,
    Active,
    Error,
}

impl BringupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BringupState::Active | BringupState::Error)
    }
}

/// What the caller must do after one step of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Resolve the device identity (entered `DriverInit`).
    ResolveIdentity,
    /// Still polling the driver.
    Waiting,
    /// One-time activation with the opened driver (entered `Active`).
    Activate(DriverHandle),
    /// Steady state: run the scheduler tick.
    Run,
    /// Dead end; nothing runs until the device is reset.
    Halted,
}

/// Forward-only boot sequencer.
///
/// The driver polls in `DriverInit` and `DriverReady` are unbounded unless a
/// wait limit is set, in which case exceeding it moves to `Error`.
#[derive(Debug)]
pub struct Bringup {
    state: BringupState,
    handle: Option<DriverHandle>,
    wait_limit: Option<u32>,
    waited: u32,
}

impl Bringup {
    pub fn new(wait_limit: Option<u32>) -> Self {
        Bringup {
            state: BringupState::IdentityInit,
            handle: None,
            wait_limit,
            waited: 0,
        }
    }

    pub fn state(&self) -> BringupState {
        self.state
    }

    pub fn handle(&self) -> Option<DriverHandle> {
        self.handle
    }

    pub fn step<D>(&mut self, driver: &mut D) -> Step
    where
        D: NetworkDriver + ?Sized,
    {
        match self.state {
            BringupState::IdentityInit => {
                self.enter(BringupState::DriverInit);
                Step::ResolveIdentity
            }
            BringupState::DriverInit => {
                if driver.is_ready() {
                    self.enter(BringupState::DriverReady);
                    Step::Waiting
                } else {
                    self.wait()
                }
            }
            BringupState::DriverReady => match driver.open() {
                Some(handle) => {
                    self.handle = Some(handle);
                    self.enter(BringupState::DriverOpen);
                    Step::Waiting
                }
                None => self.wait(),
            },
            BringupState::DriverOpen => match self.handle {
                Some(handle) => {
                    self.enter(BringupState::Active);
                    Step::Activate(handle)
                }
                None => {
                    error!("Driver open state reached without a handle");
                    self.enter(BringupState::Error);
                    Step::Halted
                }
            },
            BringupState::Active => Step::Run,
            BringupState::Error => Step::Halted,
        }
    }

    fn wait(&mut self) -> Step {
        self.waited = self.waited.saturating_add(1);
        match self.wait_limit {
            Some(limit) if self.waited > limit => {
                error!(state = ?self.state, ticks = self.waited, "Driver did not come up");
                self.enter(BringupState::Error);
                Step::Halted
            }
            _ => Step::Waiting,
        }
    }

    fn enter(&mut self, next: BringupState) {
        info!(from = ?self.state, to = ?next, "Bring-up state change");
        self.state = next;
        self.waited = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverEvent, WifiCredentials, WifiMode};

    #[derive(Default)]
    struct ScriptedDriver {
        ready_after: u32,
        open_after: u32,
        ready_polls: u32,
        open_polls: u32,
    }

    impl NetworkDriver for ScriptedDriver {
        fn is_ready(&mut self) -> bool {
            self.ready_polls += 1;
            self.ready_polls > self.ready_after
        }
        fn open(&mut self) -> Option<DriverHandle> {
            self.open_polls += 1;
            (self.open_polls > self.open_after).then_some(DriverHandle(7))
        }
        fn enable_time_sync(&mut self, _: DriverHandle, _: &str) {}
        fn start(&mut self, _: DriverHandle, _: WifiMode, _: Option<&WifiCredentials>) {}
        fn poll_events(&mut self) -> Vec<DriverEvent> {
            Vec::new()
        }
    }

    #[test]
    fn test_forward_path() {
        let mut driver = ScriptedDriver::default();
        let mut bringup = Bringup::new(None);

        assert_eq!(bringup.step(&mut driver), Step::ResolveIdentity);
        assert_eq!(bringup.state(), BringupState::DriverInit);
        assert_eq!(bringup.step(&mut driver), Step::Waiting);
        assert_eq!(bringup.state(), BringupState::DriverReady);
        assert_eq!(bringup.step(&mut driver), Step::Waiting);
        assert_eq!(bringup.state(), BringupState::DriverOpen);
        assert_eq!(bringup.step(&mut driver), Step::Activate(DriverHandle(7)));
        assert_eq!(bringup.state(), BringupState::Active);
        assert_eq!(bringup.step(&mut driver), Step::Run);
        assert!(bringup.state().is_terminal());
    }

    #[test]
    fn test_not_active_before_ready_and_handle() {
        let mut driver = ScriptedDriver {
            ready_after: 5,
            open_after: 3,
            ..Default::default()
        };
        let mut bringup = Bringup::new(None);
        let mut seen = vec![bringup.state()];

        for _ in 0..20 {
            bringup.step(&mut driver);
            if seen.last() != Some(&bringup.state()) {
                seen.push(bringup.state());
            }
        }

        assert_eq!(
            seen,
            vec![
                BringupState::IdentityInit,
                BringupState::DriverInit,
                BringupState::DriverReady,
                BringupState::DriverOpen,
                BringupState::Active,
            ]
        );
        // open is only attempted after the driver reported ready
        assert_eq!(driver.ready_polls, 6);
        assert_eq!(driver.open_polls, 4);
    }

    #[test]
    fn test_unbounded_wait_by_default() {
        let mut driver = ScriptedDriver {
            ready_after: u32::MAX,
            ..Default::default()
        };
        let mut bringup = Bringup::new(None);
        for _ in 0..10_000 {
            bringup.step(&mut driver);
        }
        assert_eq!(bringup.state(), BringupState::DriverInit);
    }

    #[test]
    fn test_wait_limit_ends_in_error() {
        let mut driver = ScriptedDriver {
            open_after: u32::MAX,
            ..Default::default()
        };
        let mut bringup = Bringup::new(Some(3));

        bringup.step(&mut driver);
        bringup.step(&mut driver);
        assert_eq!(bringup.state(), BringupState::DriverReady);
        for _ in 0..3 {
            assert_eq!(bringup.step(&mut driver), Step::Waiting);
        }
        assert_eq!(bringup.step(&mut driver), Step::Halted);
        assert_eq!(bringup.state(), BringupState::Error);

        // inert
        assert_eq!(bringup.step(&mut driver), Step::Halted);
        assert_eq!(bringup.state(), BringupState::Error);
        assert!(bringup.handle().is_none());
    }
}
