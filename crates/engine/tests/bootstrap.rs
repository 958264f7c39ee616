use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use flowforge_core::ProcessDefinitionId;
use flowforge_engine::config::keys;
use flowforge_engine::services::{
    DmnRepositoryService, DmnRuleService, FormRepositoryService, FormService, ServiceRegistry,
    TaskService,
};
use flowforge_engine::{
    ConfigError, DmnEngineConfigurator, EngineConfiguration, EngineConfigurator, EngineError,
    EngineProperties, EngineResult, FormEngineConfigurator, ProcessEngine,
};

fn quiet_properties() -> EngineProperties {
    EngineProperties::new().with(keys::ASYNC_EXECUTOR_ACTIVATE, "false")
}

#[tokio::test]
async fn mail_host_without_port_fails_bootstrap() {
    let props = quiet_properties().with(keys::EMAIL_HOST, "smtp.example.com");
    let err = ProcessEngine::builder(props).build().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::MissingProperty(ref key)) if key == "email.port"
    ));
}

#[tokio::test]
async fn unparsable_pool_size_fails_bootstrap() {
    let props = quiet_properties().with(keys::CORE_POOL_SIZE, "many");
    let err = ProcessEngine::builder(props).build().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Config(ConfigError::InvalidProperty { ref key, .. }) if key == keys::CORE_POOL_SIZE
    ));
}

#[tokio::test]
async fn core_services_are_registered_and_external_ones_are_not() {
    let engine = ProcessEngine::builder(quiet_properties().with(keys::ENGINE_NAME, "orders"))
        .build()
        .await
        .unwrap();

    assert_eq!(engine.name(), "orders");
    assert!(engine.repository_service().is_ok());
    assert!(engine.runtime_service().is_ok());
    assert!(engine.management_service().is_ok());
    assert!(!engine.async_executor().is_active());

    assert!(matches!(
        engine.task_service(),
        Err(EngineError::ServiceUnavailable("task"))
    ));
    assert!(matches!(
        engine.content_service(),
        Err(EngineError::ServiceUnavailable("content"))
    ));
    assert!(matches!(
        engine.dmn_rule_service(),
        Err(EngineError::ServiceUnavailable("dmn-rule"))
    ));
}

struct Recording {
    name: &'static str,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EngineConfigurator for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn before_init(&self, config: &mut EngineConfiguration) -> Result<(), ConfigError> {
        config.definition_cache_limit = i64::from(self.priority);
        self.log.lock().unwrap().push(format!("before:{}", self.name));
        Ok(())
    }

    async fn configure(
        &self,
        _services: &mut ServiceRegistry,
        config: &EngineConfiguration,
    ) -> EngineResult<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("configure:{}:{}", self.name, config.definition_cache_limit));
        Ok(())
    }
}

#[tokio::test]
async fn configurators_run_in_priority_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = |name, priority| {
        Arc::new(Recording {
            name,
            priority,
            log: log.clone(),
        })
    };

    let engine = ProcessEngine::builder(quiet_properties())
        .configurator(make("late", 50))
        .configurator(make("early", 5))
        .configurator(make("middle", 20))
        .build()
        .await
        .unwrap();

    // the last before_init hook set the limit
    assert_eq!(engine.configuration().definition_cache_limit, 50);
    assert_eq!(engine.definition_cache().stats().capacity, Some(50));

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec![
            "before:early",
            "before:middle",
            "before:late",
            "configure:early:50",
            "configure:middle:50",
            "configure:late:50",
        ]
    );
}

struct FailingConfigurator;

#[async_trait]
impl EngineConfigurator for FailingConfigurator {
    fn name(&self) -> &str {
        "broken"
    }

    async fn configure(
        &self,
        _services: &mut ServiceRegistry,
        _config: &EngineConfiguration,
    ) -> EngineResult<()> {
        Err(EngineError::configurator(self.name(), "sub-engine refused to start"))
    }
}

#[tokio::test]
async fn failing_configurator_aborts_bootstrap() {
    let err = ProcessEngine::builder(quiet_properties())
        .configurator(Arc::new(FailingConfigurator))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configurator { ref name, .. } if name == "broken"));
}

struct Forms;

#[async_trait]
impl FormRepositoryService for Forms {
    async fn deploy_form(&self, key: &str, _definition: Value) -> EngineResult<String> {
        Ok(format!("form:{key}"))
    }

    async fn get_form_definition(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(Some(json!({ "key": key })))
    }
}

#[async_trait]
impl FormService for Forms {
    async fn start_form(&self, _id: ProcessDefinitionId) -> EngineResult<Option<Value>> {
        Ok(None)
    }

    async fn submit_form(&self, _form_key: &str, _values: Value) -> EngineResult<()> {
        Ok(())
    }
}

struct Decisions;

#[async_trait]
impl DmnRepositoryService for Decisions {
    async fn deploy_decision(&self, resource_name: &str, _xml: &str) -> EngineResult<String> {
        Ok(resource_name.to_string())
    }

    async fn list_decisions(&self) -> EngineResult<Vec<String>> {
        Ok(vec!["discount".to_string()])
    }
}

#[async_trait]
impl DmnRuleService for Decisions {
    async fn execute_decision(&self, decision_key: &str, input: Value) -> EngineResult<Value> {
        Ok(json!({ "decision": decision_key, "input": input }))
    }
}

struct Tasks;

#[async_trait]
impl TaskService for Tasks {
    async fn list_tasks(&self, _assignee: Option<&str>) -> EngineResult<Vec<Value>> {
        Ok(vec![json!({ "id": "t-1" })])
    }

    async fn complete_task(&self, _task_id: &str, _variables: Value) -> EngineResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn sub_engine_and_embedder_services_become_available() {
    let forms = Arc::new(Forms);
    let decisions = Arc::new(Decisions);

    let engine = ProcessEngine::builder(quiet_properties())
        .configurator(Arc::new(FormEngineConfigurator::new(forms.clone(), forms)))
        .configurator(Arc::new(DmnEngineConfigurator::new(
            decisions.clone(),
            decisions,
        )))
        .service::<dyn TaskService>(Arc::new(Tasks))
        .build()
        .await
        .unwrap();

    let form_repo = engine.form_repository_service().unwrap();
    assert_eq!(form_repo.deploy_form("leave", json!({})).await.unwrap(), "form:leave");
    assert!(engine.form_service().is_ok());

    let rules = engine.dmn_rule_service().unwrap();
    let out = rules.execute_decision("discount", json!({ "total": 10 })).await.unwrap();
    assert_eq!(out["decision"], "discount");
    assert_eq!(
        engine.dmn_repository_service().unwrap().list_decisions().await.unwrap(),
        vec!["discount"]
    );

    let tasks = engine.task_service().unwrap().list_tasks(None).await.unwrap();
    assert_eq!(tasks.len(), 1);
}
