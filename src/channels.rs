use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub from_clients: broadcast::Sender<crate::server::ChannelData>,
    pub to_clients: broadcast::Sender<crate::server::Reply>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            from_clients: Self::channel(),
            to_clients: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
