use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::HandlerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteContext {
    pub client_addr: SocketAddr,
    pub origin_addr: String,
    parameter: String,
}

impl RouteContext {
    pub(crate) fn new(client_addr: SocketAddr, origin_addr: String, parameter: String) -> Self {
        Self {
            client_addr,
            origin_addr,
            parameter,
        }
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, context: &mut RouteContext) -> Result<(), HandlerError>;
}

#[derive(Default)]
pub(crate) struct CommandHandlers {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandHandlers {
    pub(crate) fn register(&mut self, command: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .insert(command.to_ascii_uppercase(), handler);
    }

    pub(crate) fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command).cloned()
    }
}

pub struct RouteTableHandler {
    routes: BTreeMap<String, String>,
}

impl RouteTableHandler {
    pub fn new(routes: BTreeMap<String, String>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl CommandHandler for RouteTableHandler {
    async fn handle(&self, context: &mut RouteContext) -> Result<(), HandlerError> {
        if let Some(origin) = self.routes.get(context.parameter()) {
            context.origin_addr = origin.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::{CommandHandler, CommandHandlers, RouteContext, RouteTableHandler};

    fn sample_context() -> RouteContext {
        let client_addr: SocketAddr = "127.0.0.1:50000".parse().expect("client addr");
        RouteContext::new(client_addr, "ftp.internal:21".to_string(), "bob".to_string())
    }

    #[tokio::test]
    async fn route_table_rewrites_known_users() {
        let mut routes = BTreeMap::new();
        routes.insert("bob".to_string(), "10.0.0.2:21".to_string());
        let handler = RouteTableHandler::new(routes);

        let mut context = sample_context();
        handler.handle(&mut context).await.expect("handle");
        assert_eq!(context.origin_addr, "10.0.0.2:21");
    }

    #[tokio::test]
    async fn route_table_leaves_unknown_users_on_default_origin() {
        let handler = RouteTableHandler::new(BTreeMap::new());
        let mut context = sample_context();
        handler.handle(&mut context).await.expect("handle");
        assert_eq!(context.origin_addr, "ftp.internal:21");
    }

    #[test]
    fn registry_lookups_are_case_insensitive_on_registration() {
        let mut handlers = CommandHandlers::default();
        handlers.register("user", Arc::new(RouteTableHandler::new(BTreeMap::new())));
        assert!(handlers.get("USER").is_some());
        assert!(handlers.get("PASS").is_none());
    }
}
