use crate::proxy::ProxyGateway;
use crate::supervisor::ProcessSupervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: ProcessSupervisor,
    pub gateway: ProxyGateway,
}

impl AppState {
    pub fn new(gateway: ProxyGateway) -> Self {
        Self {
            supervisor: gateway.supervisor().clone(),
            gateway,
        }
    }
}
