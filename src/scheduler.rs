use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::catalog::SearchService;
use crate::preview::PreviewService;
use crate::session::{Effect, Event};

/// Runs background work for one session and funnels every completion back
/// into a single inbox, so the control loop applies results in arrival order.
pub struct Scheduler {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    search: Arc<dyn SearchService>,
    preview: Arc<dyn PreviewService>,
}

impl Scheduler {
    pub fn new(search: Arc<dyn SearchService>, preview: Arc<dyn PreviewService>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            search,
            preview,
        }
    }

    pub fn inbox(&self) -> &Receiver<Event> {
        &self.rx
    }

    /// Starts the work an effect describes. Effects that act on the terminal
    /// itself are handed back to the caller.
    pub fn dispatch(&self, effect: Effect) -> Option<Effect> {
        match effect {
            Effect::Fetch {
                generation,
                query,
                page,
            } => {
                let search = self.search.clone();
                let tx = self.tx.clone();
                thread::spawn(move || {
                    let result = search.search(&query, page);
                    let _ = tx.send(Event::PostsFetched { generation, result });
                });
                None
            }
            Effect::Preview {
                generation,
                request,
                cancel,
            } => {
                let preview = self.preview.clone();
                let tx = self.tx.clone();
                thread::spawn(move || {
                    let result = preview.load(&request, &cancel);
                    if cancel.is_cancelled() {
                        debug!(generation, post = request.post_id, "preview superseded");
                    }
                    let _ = tx.send(Event::PreviewLoaded { generation, result });
                });
                None
            }
            Effect::ExpireStatus { token, after } => {
                let tx = self.tx.clone();
                thread::spawn(move || {
                    thread::sleep(after);
                    let _ = tx.send(Event::StatusExpired { token });
                });
                None
            }
            other => Some(other),
        }
    }
}
