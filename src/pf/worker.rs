//! Kickable background worker.
//!
//! Stand-in for the kernel's unbound workqueue items: a dedicated thread
//! that runs its body once per kick, coalescing kicks that arrive while a
//! run is in flight.

use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::JoinHandle;

enum Cmd {
    Kick,
    Stop,
}

pub(crate) struct Worker {
    tx: Sender<Cmd>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(name: &str, body: impl Fn() + Send + 'static) -> Self {
        let (tx, rx) = channel();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&rx, &body))
            .expect("failed to spawn worker thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    fn run(rx: &Receiver<Cmd>, body: &(impl Fn() + Send + 'static)) {
        loop {
            match rx.recv() {
                Ok(Cmd::Kick) => {}
                Ok(Cmd::Stop) | Err(_) => return,
            }
            // Coalesce kicks that piled up while we were idle.
            loop {
                match rx.try_recv() {
                    Ok(Cmd::Kick) => {}
                    Ok(Cmd::Stop) => return,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            body();
        }
    }

    pub fn kick(&self) {
        let _ = self.tx.send(Cmd::Kick);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.tx.send(Cmd::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
