/// Events emitted by a service registry.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent<S> {
    /// First sighting of a service.
    Available(S),
    /// A known service was seen again or changed.
    Updated(S),
    /// A service was removed or went stale.
    Unavailable(S),
}

impl<S> DiscoveryEvent<S> {
    pub fn service(&self) -> &S {
        match self {
            DiscoveryEvent::Available(s)
            | DiscoveryEvent::Updated(s)
            | DiscoveryEvent::Unavailable(s) => s,
        }
    }
}
