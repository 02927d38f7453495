use crate::config::Target;
use crate::model::Observation;
use crate::probe::Prober;
use crate::BoxFuture;

/// Supplier of zero or more observations per target per cycle
///
/// The local prober yields exactly one observation; a multi-region
/// health-check provider may yield several or none.
pub trait ObservationSource: Send + Sync {
    fn observe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Vec<Observation>>;
}

impl ObservationSource for Prober {
    fn observe<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Vec<Observation>> {
        Box::pin(async move { vec![self.probe(target).await] })
    }
}
