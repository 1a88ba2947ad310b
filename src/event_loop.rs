//! Cooperative task loops. A group is a small fixed pool of OS threads,
//! each draining its own channel of boxed tasks; work scheduled on one
//! loop runs in submission order on that loop's thread. The client pins
//! its scheduler to a single loop so scheduler state needs no locking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

/// Cheap handle to one loop of a group.
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: Sender<Message>,
}

impl EventLoopHandle {
    /// Queue a task; returns false when the loop has shut down.
    pub fn schedule(&self, task: Task) -> bool {
        self.tx.send(Message::Run(task)).is_ok()
    }
}

pub struct EventLoopGroup {
    senders: Vec<Sender<Message>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (tx, rx) = unbounded::<Message>();
            let handle = thread::spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Run(task) => task(),
                        Message::Shutdown => break,
                    }
                }
            });
            senders.push(tx);
            handles.push(handle);
        }
        Self {
            senders,
            handles,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Handle to a specific loop (index wraps).
    pub fn handle(&self, index: usize) -> EventLoopHandle {
        EventLoopHandle {
            tx: self.senders[index % self.senders.len()].clone(),
        }
    }

    /// Round-robin handle across the group.
    pub fn next_handle(&self) -> EventLoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.handle(index)
    }

    /// Stop accepting work after queued tasks drain, and join the threads.
    /// A loop shutting its own group down is detached, not joined.
    pub fn shutdown(&mut self) {
        for tx in &self.senders {
            let _ = tx.send(Message::Shutdown);
        }
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}
