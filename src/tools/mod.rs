pub mod builtins;
pub mod dispatcher;
pub mod tool;

pub use builtins::{FarmServices, advisor_tools};
pub use dispatcher::{ResponseSink, ToolCallDispatcher};
pub use tool::ToolHandler;

/// Dispatcher with the advisor toolset registered.
pub fn init_advisor_dispatcher(
    services: &FarmServices,
    farm: &crate::farm::FarmProfile,
) -> ToolCallDispatcher {
    let mut dispatcher = ToolCallDispatcher::new();
    for tool in advisor_tools(services, farm) {
        dispatcher.register(tool);
    }
    dispatcher
}
