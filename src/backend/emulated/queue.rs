use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{trace, warn};

use super::kernels::{EntryPoint, LaunchContext};
use super::{Defines, EmulatedMemory, KernelArg};
use crate::backend::{BackendError, LaunchGeometry};

pub(super) struct Launch {
    pub(super) entry: EntryPoint,
    pub(super) defines: Arc<Defines>,
    pub(super) args: Vec<KernelArg>,
    pub(super) geometry: LaunchGeometry,
}

impl Launch {
    fn run(&self) -> Result<(), BackendError> {
        let context = LaunchContext::new(&self.entry.name, &self.args, &self.defines, &self.geometry);
        (self.entry.run)(&context)
    }
}

pub(super) enum Command {
    Launch(Launch),
    Write {
        memory: EmulatedMemory,
        offset: usize,
        data: Vec<u8>,
        done: Sender<Result<(), BackendError>>,
    },
    Read {
        memory: EmulatedMemory,
        len: usize,
        done: Sender<Result<Vec<u8>, BackendError>>,
    },
    Shutdown,
}

/// In-order command queue backed by one worker thread.
pub struct EmulatedQueue {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl EmulatedQueue {
    pub(super) fn spawn(device_name: &str) -> Result<Self, BackendError> {
        let (commands, inbox) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name(format!("{device_name}-queue"))
            .spawn(move || queue_worker_loop(inbox))
            .map_err(|err| BackendError::Device(format!("could not start queue worker: {err}")))?;
        Ok(Self {
            commands,
            worker: Some(worker),
        })
    }

    pub(super) fn submit(&self, command: Command) -> Result<(), BackendError> {
        self.commands
            .send(command)
            .map_err(|_| BackendError::Device("queue worker exited".to_string()))
    }
}

impl Drop for EmulatedQueue {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// A failed launch poisons the queue: later transfers report the fault the
/// way a lost device would, and later launches are skipped.
fn queue_worker_loop(inbox: Receiver<Command>) {
    let mut fault: Option<BackendError> = None;
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Shutdown => break,
            Command::Launch(launch) => {
                if fault.is_some() {
                    continue;
                }
                trace!(entry = %launch.entry.name, items = launch.geometry.items(), "launch");
                if let Err(err) = launch.run() {
                    warn!(entry = %launch.entry.name, error = %err, "emulated kernel failed");
                    fault = Some(err);
                }
            }
            Command::Write {
                memory,
                offset,
                data,
                done,
            } => {
                let result = match &fault {
                    Some(err) => Err(err.clone()),
                    None => memory.write_at(offset, &data),
                };
                let _ = done.send(result);
            }
            Command::Read { memory, len, done } => {
                let result = match &fault {
                    Some(err) => Err(err.clone()),
                    None => memory.snapshot(len),
                };
                let _ = done.send(result);
            }
        }
    }
}
