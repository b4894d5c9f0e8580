use serde::{Deserialize, Serialize};

/// Where a run was triggered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeFrom {
    #[default]
    ServiceApi,
    WebApp,
    Explore,
    Debugger,
    Schedule,
}

/// Identity and tracing data for one run.
///
/// Threaded explicitly through the dispatcher, every node executor and every
/// published event instead of living in task-local state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub app_id: String,
    pub workflow_id: String,
    pub workflow_execution_id: String,
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub trace_id: String,
    #[serde(default)]
    pub invoke_from: InvokeFrom,
}

impl ExecutionContext {
    pub fn new(tenant_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workflow_id: workflow_id.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_invoke_from(mut self, invoke_from: InvokeFrom) -> Self {
        self.invoke_from = invoke_from;
        self
    }
}
