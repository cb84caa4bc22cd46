//! Backend Worker Thread Implementation
//!
//! This module contains the command loop that runs in the backend thread. It
//! receives [`BackendCommand`]s from the frontend and routes them to the
//! [`DeviceOrchestrator`], which owns devices and streaming workers.
//!
//! # Responsibilities
//!
//! - **Command routing**: connect, start, stop, disconnect, configure, save path
//! - **Connection progress**: applies results of background connection attempts
//! - **Shutdown**: stops streaming and releases hardware before exiting
//!
//! Commands never block on hardware: connecting runs on separate threads and
//! streaming runs on the orchestrator's workers, so the loop stays responsive
//! to stop and shutdown requests.

use crate::backend::{BackendCommand, DeviceOrchestrator, Reporter};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wait for a command before polling connection progress again
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Backend command loop
pub struct BackendWorker {
    orchestrator: DeviceOrchestrator,
    command_rx: Receiver<BackendCommand>,
    reporter: Reporter,
    running: Arc<AtomicBool>,
}

impl BackendWorker {
    pub fn new(
        orchestrator: DeviceOrchestrator,
        command_rx: Receiver<BackendCommand>,
        reporter: Reporter,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            orchestrator,
            command_rx,
            reporter,
            running,
        }
    }

    pub fn orchestrator(&self) -> &DeviceOrchestrator {
        &self.orchestrator
    }

    /// Run the main worker loop
    pub fn run(&mut self) {
        tracing::info!("Backend worker started");

        while self.running.load(Ordering::SeqCst) {
            self.wait_for_command();
            self.process_commands();
            self.orchestrator.poll_events();
        }

        // Cleanup
        self.orchestrator.disconnect();

        self.reporter.shutdown();
        tracing::info!("Backend worker stopped");
    }

    fn wait_for_command(&mut self) {
        match self.command_rx.recv_timeout(COMMAND_POLL_INTERVAL) {
            Ok(cmd) => self.handle_command(cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Process pending commands from the frontend
    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    /// Handle a single command
    fn handle_command(&mut self, cmd: BackendCommand) {
        tracing::debug!("Command: {:?}", cmd);
        let result = match cmd {
            BackendCommand::Connect => self.orchestrator.connect(),
            BackendCommand::Start => self.orchestrator.start(),
            BackendCommand::Stop => {
                self.orchestrator.stop();
                Ok(())
            }
            BackendCommand::Disconnect => {
                self.orchestrator.disconnect();
                Ok(())
            }
            BackendCommand::Configure(update) => self.orchestrator.configure(update),
            BackendCommand::SetSave(path) => {
                self.orchestrator.set_save_path(path);
                Ok(())
            }
            BackendCommand::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.reporter.error(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendMessage, ParamUpdate};
    use crate::config::{AddressBook, DeviceConfig, ExperimentConfig};
    use crate::hardware::sim::{SimDeviceSpec, SimDriver};
    use crate::types::{ConnectionState, LogLevel};
    use crossbeam_channel::{bounded, Sender};
    use std::sync::Mutex;

    fn create_test_worker() -> (BackendWorker, Receiver<BackendMessage>, Sender<BackendCommand>) {
        let (cmd_tx, cmd_rx) = bounded(16);
        let (msg_tx, msg_rx) = bounded(1024);
        let running = Arc::new(AtomicBool::new(true));
        let config = ExperimentConfig {
            devices: vec![DeviceConfig::new("usrp0", vec![100e3, 125e3], 2.4e9)],
            ..Default::default()
        };
        let driver = Arc::new(SimDriver::new().with_device(SimDeviceSpec::new("usrp0", "A1")));
        let reporter = Reporter::new(msg_tx.clone(), msg_tx);
        let orchestrator = DeviceOrchestrator::new(
            config,
            driver,
            Arc::new(Mutex::new(AddressBook::in_memory())),
            reporter.clone(),
        );

        let worker = BackendWorker::new(orchestrator, cmd_rx, reporter, running);

        (worker, msg_rx, cmd_tx)
    }

    fn errors(rx: &Receiver<BackendMessage>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|m| match m {
                BackendMessage::Log {
                    level: LogLevel::Error,
                    message,
                } => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_shutdown_command() {
        let (mut worker, _, cmd_tx) = create_test_worker();

        cmd_tx.send(BackendCommand::Shutdown).unwrap();
        worker.process_commands();

        assert!(!worker.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_closed_command_channel_stops_worker() {
        let (mut worker, _, cmd_tx) = create_test_worker();
        drop(cmd_tx);
        worker.process_commands();
        assert!(!worker.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rejected_commands_are_reported() {
        let (mut worker, msg_rx, cmd_tx) = create_test_worker();

        cmd_tx.send(BackendCommand::Start).unwrap();
        cmd_tx
            .send(BackendCommand::Configure(ParamUpdate::SaveDs(0)))
            .unwrap();
        worker.process_commands();

        assert_eq!(errors(&msg_rx).len(), 2);
        assert!(!worker.orchestrator().is_running());
        assert_eq!(worker.orchestrator().config().save_ds, 100);
    }

    #[test]
    fn test_stop_and_disconnect_when_idle() {
        let (mut worker, msg_rx, cmd_tx) = create_test_worker();

        cmd_tx.send(BackendCommand::Stop).unwrap();
        cmd_tx.send(BackendCommand::Stop).unwrap();
        cmd_tx.send(BackendCommand::Disconnect).unwrap();
        worker.process_commands();

        assert!(errors(&msg_rx).is_empty());
        assert_eq!(worker.orchestrator().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_run_connects_and_shuts_down() {
        let (mut worker, msg_rx, cmd_tx) = create_test_worker();

        cmd_tx.send(BackendCommand::Connect).unwrap();
        let handle = std::thread::spawn(move || {
            worker.run();
            worker
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut connected = false;
        while !connected && std::time::Instant::now() < deadline {
            if let Ok(BackendMessage::Status { device_id, state }) =
                msg_rx.recv_timeout(Duration::from_millis(50))
            {
                connected = device_id == "multi_usrp" && state == ConnectionState::Connected;
            }
        }
        assert!(connected);

        cmd_tx.send(BackendCommand::Shutdown).unwrap();
        let worker = handle.join().unwrap();
        assert_eq!(worker.orchestrator().state(), ConnectionState::Disconnected);
        assert!(msg_rx.try_iter().any(|m| matches!(m, BackendMessage::Shutdown)));
    }
}
