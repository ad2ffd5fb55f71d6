//! Bounded pool of threads, each polling a block of registered I/O sources
//! and dispatching a per-source callback on readiness.
//!
//! Handles may be added or removed at any time without restarting the
//! pool. The registry side of `mio` is shareable (`Registry::register`
//! only needs `&self`), so registration never has to cross into the
//! worker thread that owns the `Poll`; only the wait loop itself does.
//! The handle table is never locked across a callback invocation, since a
//! callback may itself call `add_handle`/`remove_handle`.

use std::collections::HashMap as StdHashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::{Events, Interest, Registry, Token, Waker};
use parking_lot::RwLock;

/// Invoked on a worker thread when a registered source becomes ready.
pub type Callback = Arc<dyn Fn(Token) + Send + Sync>;

const WAKE_TOKEN: Token = Token(usize::MAX);

struct Block {
    registry: Registry,
    waker: Waker,
    handles: RwLock<StdHashMap<Token, Callback>>,
}

/// A bounded pool of one thread per block, each block holding up to
/// `handles_per_block` registrations.
pub struct WorkerPool {
    handles_per_block: usize,
    blocks: RwLock<Vec<Arc<Block>>>,
    threads: RwLock<Vec<JoinHandle<()>>>,
    next_token: AtomicUsize,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl WorkerPool {
    pub fn new(handles_per_block: usize) -> io::Result<Self> {
        Ok(Self {
            handles_per_block: handles_per_block.max(1),
            blocks: RwLock::new(Vec::new()),
            threads: RwLock::new(Vec::new()),
            next_token: AtomicUsize::new(0),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    fn spawn_block(&self) -> io::Result<Arc<Block>> {
        let mut poll = mio::Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        let block = Arc::new(Block {
            registry,
            waker,
            handles: RwLock::new(StdHashMap::new()),
        });

        let worker_block = block.clone();
        let shutdown = self.shutdown.clone();

        let join = std::thread::spawn(move || {
            let mut events = Events::with_capacity(128);

            loop {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }

                if let Err(err) = poll.poll(&mut events, Some(std::time::Duration::from_millis(250))) {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("worker pool wait failed, this worker is exiting: {err}");
                    return;
                }

                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }

                    let callback = worker_block.handles.read().get(&event.token()).cloned();
                    if let Some(callback) = callback {
                        callback(event.token());
                    }
                }
            }
        });

        self.threads.write().push(join);
        Ok(block)
    }

    /// Registers `source` for `interest` with `callback`, placing it in a
    /// block with spare capacity (spawning a new block/worker if every
    /// existing block is full).
    pub fn add_handle<S>(
        &self,
        source: &mut S,
        interest: Interest,
        callback: Callback,
    ) -> io::Result<Token>
    where
        S: mio::event::Source,
    {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        let existing = self
            .blocks
            .read()
            .iter()
            .find(|b| b.handles.read().len() < self.handles_per_block)
            .cloned();

        let block = match existing {
            Some(b) => b,
            None => {
                let b = self.spawn_block()?;
                self.blocks.write().push(b.clone());
                b
            }
        };

        block.registry.register(source, token, interest)?;
        block.handles.write().insert(token, callback);
        Ok(token)
    }

    pub fn remove_handle<S>(&self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: mio::event::Source,
    {
        for block in self.blocks.read().iter() {
            if block.handles.read().contains_key(&token) {
                block.registry.deregister(source)?;
                block.handles.write().remove(&token);
                return Ok(());
            }
        }

        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        for block in self.blocks.read().iter() {
            let _ = block.waker.wake();
        }

        for thread in self.threads.write().drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_with_no_blocks() {
        let pool = WorkerPool::new(64).unwrap();
        assert!(pool.blocks.read().is_empty());
    }
}
