use std::{
    collections::VecDeque,
    sync::{mpsc::Receiver, Arc, Mutex},
    thread::JoinHandle,
};

use crate::types::Response;

pub type Outbox = Arc<Mutex<VecDeque<Response>>>;

pub fn spawn_response_relay(
    responses: Receiver<Response>,
    outbox: Outbox,
    capacity: usize,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(response) = responses.recv() {
            tracing::info!(?response, "worker response");
            push_response(&outbox, response, capacity);
        }
        tracing::debug!("response channel closed, relay stopping");
    })
}

pub fn push_response(outbox: &Outbox, response: Response, capacity: usize) {
    let mut queue = match outbox.lock() {
        Ok(val) => val,
        Err(_) => {
            tracing::error!("outbox lock poisoned, dropping response");
            return;
        }
    };

    while queue.len() >= capacity {
        if let Some(dropped) = queue.pop_front() {
            tracing::warn!(?dropped, capacity, "outbox full, dropping oldest response");
        }
    }
    queue.push_back(response);
}
