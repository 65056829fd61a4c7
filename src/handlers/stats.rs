use super::AppState;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct Stats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub workers: usize,
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    let controller = &state.controller;
    let dispatcher = controller.dispatcher();
    Json(Stats {
        memory_entries: controller.memory_cache().len(),
        memory_capacity: controller.memory_cache().capacity(),
        in_flight: controller.in_flight(),
        queued: dispatcher.queued(),
        workers: dispatcher.workers(),
    })
}
