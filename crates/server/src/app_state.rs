use server_api::ApiContext;
use shared::domain::AgentId;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) default_agent: AgentId,
}
