//! The tool host composes transports and enforces the invocation contract:
//! capability discovery, schema validation, tenant/user permissions and an
//! append-only audit trail.

use std::{collections::HashMap, sync::Arc};

use common::{
    audit::{AuditLog, AuditOutcome, AuditRecord},
    config::TenantSettings,
    error::RagError,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    schema,
    transport::{EventStream, Transport},
};

#[derive(Debug, Clone)]
pub struct ToolCapability {
    pub server_id: String,
    pub name: String,
    pub schema: Value,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ResourceCapability {
    pub server_id: String,
    pub name: String,
    pub schema: Value,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PromptCapability {
    pub server_id: String,
    pub name: String,
    pub template: String,
    pub description: String,
}

pub struct ToolHost {
    servers: RwLock<HashMap<String, Arc<dyn Transport>>>,
    tools: RwLock<HashMap<String, ToolCapability>>,
    resources: RwLock<HashMap<String, ResourceCapability>>,
    prompts: RwLock<HashMap<String, PromptCapability>>,
    tenants: HashMap<String, TenantSettings>,
    audit: Arc<dyn AuditLog>,
}

impl ToolHost {
    pub fn new(tenants: HashMap<String, TenantSettings>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
            tenants,
            audit,
        }
    }

    /// Initializes the transport and discovers its capabilities. Returns
    /// `(tools, resources, prompts)` counts.
    pub async fn connect_server(
        &self,
        server_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<(usize, usize, usize), RagError> {
        transport.initialize().await?;
        self.servers
            .write()
            .await
            .insert(server_id.to_owned(), transport);
        let counts = self.discover_capabilities(server_id).await?;
        info!(
            server_id,
            tools = counts.0,
            resources = counts.1,
            prompts = counts.2,
            "connected tool adapter"
        );
        Ok(counts)
    }

    /// Refreshes the capability cache for one server. Individual listing
    /// failures degrade that capability class rather than the connection.
    pub async fn discover_capabilities(
        &self,
        server_id: &str,
    ) -> Result<(usize, usize, usize), RagError> {
        let transport = self.transport(server_id).await?;
        let mut counts = (0usize, 0usize, 0usize);

        match transport.invoke("mcp.list_tools", Value::Object(Default::default())).await {
            Ok(result) => {
                let mut tools = self.tools.write().await;
                for tool in result.get("tools").and_then(Value::as_array).into_iter().flatten() {
                    let Some(name) = tool.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    tools.insert(
                        format!("{server_id}.{name}"),
                        ToolCapability {
                            server_id: server_id.to_owned(),
                            name: name.to_owned(),
                            schema: tool.get("schema").cloned().unwrap_or(Value::Null),
                            description: tool
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        },
                    );
                    counts.0 += 1;
                }
            }
            Err(err) => warn!(server_id, error = %err, "tool discovery failed"),
        }

        match transport
            .invoke("mcp.list_resources", Value::Object(Default::default()))
            .await
        {
            Ok(result) => {
                let mut resources = self.resources.write().await;
                for resource in result
                    .get("resources")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(name) = resource.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    resources.insert(
                        format!("{server_id}.{name}"),
                        ResourceCapability {
                            server_id: server_id.to_owned(),
                            name: name.to_owned(),
                            schema: resource.get("schema").cloned().unwrap_or(Value::Null),
                            description: resource
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        },
                    );
                    counts.1 += 1;
                }
            }
            Err(err) => warn!(server_id, error = %err, "resource discovery failed"),
        }

        match transport
            .invoke("mcp.list_prompts", Value::Object(Default::default()))
            .await
        {
            Ok(result) => {
                let mut prompts = self.prompts.write().await;
                for prompt in result
                    .get("prompts")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let Some(name) = prompt.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    prompts.insert(
                        format!("{server_id}.{name}"),
                        PromptCapability {
                            server_id: server_id.to_owned(),
                            name: name.to_owned(),
                            template: prompt
                                .get("template")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                            description: prompt
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_owned(),
                        },
                    );
                    counts.2 += 1;
                }
            }
            Err(err) => warn!(server_id, error = %err, "prompt discovery failed"),
        }

        Ok(counts)
    }

    async fn transport(&self, server_id: &str) -> Result<Arc<dyn Transport>, RagError> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| RagError::TransportClosed(format!("server {server_id} not connected")))
    }

    /// Tenant allow-list first; an optional per-user allow-list narrows
    /// further. An empty tenant list denies everything.
    fn check_permissions(
        &self,
        capability_id: &str,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), RagError> {
        let tenant = self.tenants.get(tenant_id).ok_or_else(|| {
            RagError::PermissionDenied(format!("unknown tenant {tenant_id}"))
        })?;
        if !tenant.allowed_tools.iter().any(|t| t == capability_id) {
            return Err(RagError::PermissionDenied(format!(
                "{capability_id} not allowed for tenant {tenant_id}"
            )));
        }
        if let Some(user_id) = user_id {
            if let Some(user) = tenant.users.get(user_id) {
                if !user.allowed_tools.is_empty()
                    && !user.allowed_tools.iter().any(|t| t == capability_id)
                {
                    return Err(RagError::PermissionDenied(format!(
                        "{capability_id} not allowed for user {user_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn invoke_tool(
        &self,
        tool_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Value, RagError> {
        let tool = self
            .tools
            .read()
            .await
            .get(tool_id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("tool {tool_id}")))?;

        schema::validate(&params, &tool.schema)?;
        if let Some(tenant_id) = tenant_id {
            self.check_permissions(tool_id, tenant_id, user_id)?;
        }

        let invocation_id = Uuid::new_v4();
        let started =
            AuditRecord::started(invocation_id, tool_id, tenant_id, user_id, params.clone());
        self.audit.append(started.clone()).await?;

        let transport = self.transport(&tool.server_id).await?;
        match transport.invoke(&tool.name, params).await {
            Ok(result) => {
                let result_bytes = serde_json::to_vec(&result).map(|b| b.len()).unwrap_or(0);
                self.audit
                    .append(started.finished(AuditOutcome::Succeeded { result_bytes }))
                    .await?;
                Ok(result)
            }
            Err(err) => {
                self.audit
                    .append(started.finished(AuditOutcome::Failed {
                        error: err.to_string(),
                    }))
                    .await?;
                Err(err)
            }
        }
    }

    pub async fn subscribe_resource(
        &self,
        resource_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError> {
        let resource = self
            .resources
            .read()
            .await
            .get(resource_id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("resource {resource_id}")))?;

        schema::validate(&params, &resource.schema)?;
        if let Some(tenant_id) = tenant_id {
            self.check_permissions(resource_id, tenant_id, user_id)?;
        }

        let invocation_id = Uuid::new_v4();
        self.audit
            .append(AuditRecord::started(
                invocation_id,
                resource_id,
                tenant_id,
                user_id,
                params.clone(),
            ))
            .await?;

        let transport = self.transport(&resource.server_id).await?;
        transport
            .subscribe(&resource.name, params, last_event_id)
            .await
    }

    /// Fills a discovered prompt template with `{key}` substitution.
    pub async fn get_prompt(
        &self,
        prompt_id: &str,
        params: &serde_json::Map<String, Value>,
    ) -> Result<String, RagError> {
        let prompt = self
            .prompts
            .read()
            .await
            .get(prompt_id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(format!("prompt {prompt_id}")))?;

        let mut template = prompt.template;
        for (key, value) in params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            template = template.replace(&format!("{{{key}}}"), &rendered);
        }
        Ok(template)
    }

    /// Pings every connected server; `true` means the ping round-tripped.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let servers: Vec<(String, Arc<dyn Transport>)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), Arc::clone(t)))
            .collect();

        let mut status = HashMap::new();
        for (server_id, transport) in servers {
            let healthy = transport
                .invoke("mcp.ping", Value::Object(Default::default()))
                .await
                .is_ok();
            status.insert(server_id, healthy);
        }
        status
    }

    pub async fn known_tools(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SubscriptionEvent;
    use async_trait::async_trait;
    use common::{
        audit::MemoryAuditLog,
        config::{TenantSettings, UserSettings},
    };
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Scripted transport: `mcp.list_*` replies come from fixtures, other
    /// invokes are recorded and answered from a method table.
    struct MockTransport {
        calls: StdMutex<Vec<(String, Value)>>,
        responses: HashMap<String, Result<Value, i64>>,
    }

    impl MockTransport {
        fn new() -> Self {
            let mut responses = HashMap::new();
            responses.insert(
                "mcp.list_tools".to_owned(),
                Ok(json!({"tools": [{
                    "name": "list_leads",
                    "description": "List CRM leads",
                    "schema": {"type": "object", "required": ["mode"], "properties": {"mode": {"type": "string"}}}
                }]})),
            );
            responses.insert(
                "mcp.list_resources".to_owned(),
                Ok(json!({"resources": [{"name": "lead_events", "schema": {}}]})),
            );
            responses.insert(
                "mcp.list_prompts".to_owned(),
                Ok(json!({"prompts": [{"name": "summarize", "template": "Summarize {subject} briefly."}]})),
            );
            responses.insert(
                "list_leads".to_owned(),
                Ok(json!({"items": [{"id": "lead-1"}]})),
            );
            responses.insert("mcp.ping".to_owned(), Ok(json!({"status": "success"})));
            Self {
                calls: StdMutex::new(Vec::new()),
                responses,
            }
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn initialize(&self) -> Result<(), RagError> {
            Ok(())
        }

        async fn invoke(&self, method: &str, params: Value) -> Result<Value, RagError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_owned(), params));
            match self.responses.get(method) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(code)) => Err(RagError::Rpc {
                    code: *code,
                    message: "scripted failure".into(),
                    retryable: false,
                }),
                None => Err(RagError::NotFound(format!("method {method}"))),
            }
        }

        async fn subscribe(
            &self,
            _resource: &str,
            _params: Value,
            _last_event_id: Option<String>,
        ) -> Result<EventStream, RagError> {
            let events = vec![Ok(SubscriptionEvent {
                id: Some("evt-1".into()),
                event: None,
                data: json!({"n": 1}),
            })];
            Ok(Box::pin(futures::stream::iter(events)))
        }

        async fn close(&self) -> Result<(), RagError> {
            Ok(())
        }
    }

    fn tenants() -> HashMap<String, TenantSettings> {
        let mut users = HashMap::new();
        users.insert(
            "restricted".to_owned(),
            UserSettings {
                allowed_tools: vec!["crm.other_tool".to_owned()],
            },
        );
        let mut tenants = HashMap::new();
        tenants.insert(
            "acme".to_owned(),
            TenantSettings {
                allowed_tools: vec!["crm.list_leads".to_owned(), "crm.lead_events".to_owned()],
                users,
            },
        );
        tenants.insert("empty".to_owned(), TenantSettings::default());
        tenants
    }

    async fn connected_host() -> (ToolHost, Arc<MockTransport>, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let host = ToolHost::new(tenants(), audit.clone());
        let transport = Arc::new(MockTransport::new());
        host.connect_server("crm", transport.clone()).await.unwrap();
        (host, transport, audit)
    }

    #[tokio::test]
    async fn discovery_caches_capabilities_by_server_and_name() {
        let (host, _, _) = connected_host().await;
        assert_eq!(host.known_tools().await, vec!["crm.list_leads".to_owned()]);
    }

    #[tokio::test]
    async fn invoke_strips_server_prefix_and_returns_result() {
        let (host, transport, _) = connected_host().await;
        let result = host
            .invoke_tool("crm.list_leads", json!({"mode": "full"}), Some("acme"), None)
            .await
            .unwrap();
        assert_eq!(result["items"][0]["id"], "lead-1");

        let calls = transport.calls();
        assert!(calls.iter().any(|(m, _)| m == "list_leads"));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (host, _, _) = connected_host().await;
        let err = host
            .invoke_tool("crm.missing", json!({}), Some("acme"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn schema_violation_rejected_before_transport() {
        let (host, transport, _) = connected_host().await;
        let before = transport.calls().len();
        let err = host
            .invoke_tool("crm.list_leads", json!({}), Some("acme"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::SchemaInvalid(_)));
        assert_eq!(transport.calls().len(), before);
    }

    #[tokio::test]
    async fn tenant_allow_list_denies_unknown_and_empty() {
        let (host, _, _) = connected_host().await;
        let err = host
            .invoke_tool("crm.list_leads", json!({"mode": "full"}), Some("globex"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::PermissionDenied(_)));

        let err = host
            .invoke_tool("crm.list_leads", json!({"mode": "full"}), Some("empty"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn user_allow_list_narrows_tenant_grant() {
        let (host, _, _) = connected_host().await;
        let err = host
            .invoke_tool(
                "crm.list_leads",
                json!({"mode": "full"}),
                Some("acme"),
                Some("restricted"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::PermissionDenied(_)));

        // Users without an explicit allow-list inherit the tenant's.
        host.invoke_tool(
            "crm.list_leads",
            json!({"mode": "full"}),
            Some("acme"),
            Some("ada"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn audit_records_start_and_outcome() {
        let (host, _, audit) = connected_host().await;
        host.invoke_tool("crm.list_leads", json!({"mode": "full"}), Some("acme"), None)
            .await
            .unwrap();

        let records = audit.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, AuditOutcome::Started);
        assert_eq!(records[0].tenant_id.as_deref(), Some("acme"));
        assert!(matches!(
            records[1].outcome,
            AuditOutcome::Succeeded { result_bytes } if result_bytes > 0
        ));
        assert_eq!(records[0].invocation_id, records[1].invocation_id);
    }

    #[tokio::test]
    async fn prompt_templates_fill_parameters() {
        let (host, _, _) = connected_host().await;
        let mut params = serde_json::Map::new();
        params.insert("subject".to_owned(), json!("quarterly numbers"));
        let filled = host.get_prompt("crm.summarize", &params).await.unwrap();
        assert_eq!(filled, "Summarize quarterly numbers briefly.");
    }

    #[tokio::test]
    async fn health_check_reports_per_server() {
        let (host, _, _) = connected_host().await;
        let status = host.health_check().await;
        assert_eq!(status.get("crm"), Some(&true));
    }
}
