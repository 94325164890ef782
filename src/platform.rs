use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::Result;
use crossbeam_channel::Sender;

#[cfg(unix)]
use signal_hook::{
    consts::{SIGINT, SIGTERM, SIGUSR1},
    iterator::Signals,
};

#[cfg(windows)]
use signal_hook::{consts::SIGINT, iterator::Signals};

/// Standard Unix exit codes
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUsage = 2,
    SignalInt = 130,  // 128 + SIGINT (2)
    SignalTerm = 143, // 128 + SIGTERM (15)
}

impl ExitCode {
    pub fn exit(self) -> ! {
        process::exit(self as i32)
    }
}

/// Global termination flag for graceful shutdown
pub static SHOULD_TERMINATE: AtomicBool = AtomicBool::new(false);

/// Control messages broadcast by the signal handler to the main loop
#[derive(Debug, Clone)]
pub enum Ctrl {
    Shutdown { immediate: bool },
    PrintStats,
}

/// Signal handler for graceful shutdown. A second shutdown signal exits
/// immediately without draining.
pub struct SignalHandler {
    _handle: thread::JoinHandle<()>,
}

impl SignalHandler {
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        #[cfg(unix)]
        let signals_to_handle = vec![SIGINT, SIGTERM, SIGUSR1];

        #[cfg(windows)]
        let signals_to_handle = vec![SIGINT]; // Windows only supports SIGINT reliably

        let mut signals = Signals::new(&signals_to_handle)?;

        let handle = thread::spawn(move || {
            let mut shutdown_count = 0;
            for sig in signals.forever() {
                match sig {
                    SIGINT => {
                        SHOULD_TERMINATE.store(true, Ordering::Relaxed);
                        shutdown_count += 1;
                        let immediate = shutdown_count > 1;
                        let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                        if immediate {
                            ExitCode::SignalInt.exit();
                        }
                    }
                    #[cfg(unix)]
                    SIGTERM => {
                        tracing::info!("received SIGTERM, shutting down gracefully");
                        SHOULD_TERMINATE.store(true, Ordering::Relaxed);
                        shutdown_count += 1;
                        let immediate = shutdown_count > 1;
                        let _ = ctrl_sender.send(Ctrl::Shutdown { immediate });
                        if immediate {
                            ExitCode::SignalTerm.exit();
                        }
                    }
                    #[cfg(unix)]
                    SIGUSR1 => {
                        let _ = ctrl_sender.send(Ctrl::PrintStats);
                    }
                    _ => {
                        tracing::warn!(signal = sig, "received unexpected signal");
                    }
                }
            }
        });

        Ok(SignalHandler { _handle: handle })
    }

    /// Check if we should terminate processing
    pub fn should_terminate() -> bool {
        SHOULD_TERMINATE.load(Ordering::Relaxed)
    }
}
