//! The asynchronous compiler pool.
//!
//! A bounded set of worker threads draining one multi-producer,
//! multi-consumer queue of compilation jobs (block tier promotions, shader
//! compiles). Jobs must be idempotent: the publish step of every job type
//! re-checks whether a newer job already produced the artifact, so
//! submitting the same work twice is harmless. Shutdown is deterministic:
//! closing the queue lets every worker drain what is left and exit.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CompilerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CompilerPool {
    /// Spawns `threads` workers. `on_worker_start` runs once on each worker
    /// thread before it begins draining jobs (scheduler policy hooks in
    /// here).
    pub fn new(threads: usize, on_worker_start: Arc<dyn Fn() + Send + Sync>) -> CompilerPool {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let on_start = on_worker_start.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cellvm-compile-{index}"))
                .spawn(move || {
                    on_start();
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                    debug!("compile worker {index} drained and exiting");
                })
                .expect("spawning a compile worker cannot fail");
            workers.push(handle);
        }
        info!("compiler pool started with {threads} workers");
        CompilerPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueues a job. Returns false once the pool is shutting down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue and waits for every worker to finish the jobs it
    /// already picked up. Pending jobs still in the queue run too; nothing
    /// is required to be durable beyond this call.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
            info!("compiler pool stopped");
        }
    }
}

impl Drop for CompilerPool {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}
