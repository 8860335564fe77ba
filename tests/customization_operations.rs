//! Global choices, plugins, web resources and webhooks against a mocked Web API

mod common;

use common::{api, FakeHost};
use dataverse_connector::odata::DataverseError;
use dataverse_connector::operations::execute;
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_global_choice_add_option_looks_up_metadata_id_first() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/GlobalOptionSetDefinitions(Name='new_priority')")))
        .and(query_param("$select", "MetadataId"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"MetadataId": "m-1"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(api(
            "/GlobalOptionSetDefinitions(m-1)/Microsoft.Dynamics.CRM.InsertOptionValue",
        )))
        .and(body_partial_json(json!({
            "OptionSetName": "new_priority",
            "Value": 100000003,
            "Label": {"LocalizedLabels": [{"Label": "Urgent", "LanguageCode": 1033}]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"NewOptionValue": 100000003})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({"choiceName": "new_priority", "optionLabel": "Urgent", "optionValue": "100000003"}),
    );

    let results = execute(&host, "globalChoice", "addOption", 1).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].json,
        json!({"success": true, "choiceName": "new_priority", "newOptionValue": 100000003})
    );
}

#[tokio::test]
async fn test_global_choice_without_metadata_id_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/GlobalOptionSetDefinitions(Name='missing')")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let host = FakeHost::single(&server.uri(), json!({"choiceName": "missing"}));

    let err = execute(&host, "globalChoice", "delete", 1).await.unwrap_err();
    assert_eq!(err.source.to_string(), "Not found: Global choice not found: missing");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_global_choice_create_posts_option_set() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(api("/GlobalOptionSetDefinitions")))
        .and(body_partial_json(json!({
            "@odata.type": "Microsoft.Dynamics.CRM.OptionSetMetadata",
            "Name": "new_size",
            "OptionSetType": "Picklist"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"MetadataId": "m-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({
            "newChoiceName": "new_size",
            "displayName": "Size",
            "choiceOptions": {"option": [
                {"label": "Small", "value": 1},
                {"label": "Large", "value": 2}
            ]}
        }),
    );

    let results = execute(&host, "globalChoice", "create", 1).await.unwrap();
    assert_eq!(results[0].json["metadataId"], "m-9");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["Options"].as_array().unwrap().len(), 2);
    assert_eq!(body["Options"][1]["Value"], 2);
}

#[tokio::test]
async fn test_global_choice_list_counts_rows() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/GlobalOptionSetDefinitions")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
            {"Name": "a"}, {"Name": "b"}, {"Name": "c"}
        ]})))
        .mount(&server)
        .await;

    let host = FakeHost::single(&server.uri(), json!({}));
    let results = execute(&host, "globalChoice", "list", 1).await.unwrap();
    assert_eq!(results[0].json["count"], 3);
}

fn filter_rows() -> serde_json::Value {
    json!({"value": [
        {"sdkmessagefilterid": "f-create", "sdkmessageid": {"name": "Create", "sdkmessageid": "m-create"}},
        {"sdkmessagefilterid": "f-update", "sdkmessageid": {"name": "Update", "sdkmessageid": "m-update"}}
    ]})
}

#[tokio::test]
async fn test_register_plugin_step_binds_filter_and_type() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/sdkmessagefilters")))
        .and(query_param("$filter", "primaryobjecttypecode eq 'account'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(filter_rows()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(api("/plugintypes")))
        .and(query_param(
            "$filter",
            "_pluginassemblyid_value eq asm-1 and name eq 'Contoso.Plugins.OnUpdate'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"plugintypeid": "pt-1"}]})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(api("/sdkmessageprocessingsteps")))
        .and(body_json(json!({
            "name": "Account update",
            "mode": 0,
            "rank": 1,
            "stage": 20,
            "supporteddeployment": 0,
            "eventhandler_plugintype@odata.bind": "/plugintypes(pt-1)",
            "sdkmessageid@odata.bind": "/sdkmessages(m-update)",
            "sdkmessagefilterid@odata.bind": "/sdkmessagefilters(f-update)",
            "filteringattributes": "name,telephone1"
        })))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"sdkmessageprocessingstepid": "s-1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({
            "table": "account",
            "pluginAssemblyId": "asm-1",
            "pluginTypeName": "Contoso.Plugins.OnUpdate",
            "stepName": "Account update",
            "eventOperation": 2,
            "stage": 20,
            "filteringAttributes": "name, telephone1"
        }),
    );

    let results = execute(&host, "plugin", "registerPluginStep", 1).await.unwrap();
    assert_eq!(results[0].json["plugintypeid"], "pt-1");
    assert_eq!(results[0].json["operation"], "Update");
    assert_eq!(results[0].json["step"]["sdkmessageprocessingstepid"], "s-1");
}

#[tokio::test]
async fn test_register_plugin_step_without_matching_message() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/sdkmessagefilters")))
        .respond_with(ResponseTemplate::new(200).set_body_json(filter_rows()))
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({
            "table": "account",
            "pluginAssemblyId": "asm-1",
            "pluginTypeName": "T",
            "stepName": "S",
            "eventOperation": 3
        }),
    );

    let err = execute(&host, "plugin", "registerPluginStep", 1).await.unwrap_err();
    assert!(matches!(err.source, DataverseError::NotFound(_)));
    assert_eq!(
        err.source.to_string(),
        "Not found: No SDK message filter found for table: account and operation: Delete"
    );
}

#[tokio::test]
async fn test_register_plugin_step_rejects_unknown_event() {
    let host = FakeHost::single(
        "https://org.crm.dynamics.com",
        json!({
            "table": "account",
            "pluginAssemblyId": "asm-1",
            "pluginTypeName": "T",
            "stepName": "S",
            "eventOperation": 7
        }),
    );

    let err = execute(&host, "plugin", "registerPluginStep", 1).await.unwrap_err();
    assert_eq!(
        err.source.to_string(),
        "Invalid parameter: Unsupported event operation: 7"
    );
}

#[tokio::test]
async fn test_upload_plugin_assembly_defaults() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(api("/pluginassemblies")))
        .and(body_partial_json(json!({
            "name": "Contoso.Plugins",
            "content": "TVqQAAMAAAAEAAAA",
            "sourcetype": 0,
            "isolationmode": 2,
            "version": "1.0.0.0"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"pluginassemblyid": "asm-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({"assemblyName": "Contoso.Plugins", "dllFile": "TVqQAAMAAAAEAAAA"}),
    );

    let results = execute(&host, "plugin", "uploadPluginAssembly", 1).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_list_plugin_assemblies_respects_return_all() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/pluginassemblies")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
            {"pluginassemblyid": "a"}, {"pluginassemblyid": "b"}
        ]})))
        .mount(&server)
        .await;

    let host = FakeHost::single(&server.uri(), json!({"returnAll": true}));
    let results = execute(&host, "plugin", "listPluginAssemblies", 1).await.unwrap();
    assert_eq!(results.len(), 2);

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].url.query_pairs().any(|(k, _)| k == "$top"));
}

#[tokio::test]
async fn test_upload_javascript_web_resource_is_base64_encoded() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(api("/webresourceset")))
        .and(body_json(json!({
            "displayname": "Form script",
            "name": "new_/scripts/form.js",
            "webresourcetype": 3,
            "content": "YWxlcnQoMSk7"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"webresourceid": "w-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({
            "webResourceDisplayName": "Form script",
            "webResourceName": "new_/scripts/form.js",
            "webResourceType": 3,
            "webResourceContent": "alert(1);"
        }),
    );

    let results = execute(&host, "webresource", "uploadWebResource", 1).await.unwrap();
    assert_eq!(results[0].json["webresourceid"], "w-1");
}

#[tokio::test]
async fn test_update_web_resource_reads_stored_type() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/webresourceset(w-2)")))
        .and(query_param("$select", "webresourcetype"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"webresourcetype": 5})))
        .expect(1)
        .mount(&server)
        .await;

    // PNG content is already base64 and passes through untouched
    Mock::given(method("PATCH"))
        .and(path(api("/webresourceset(w-2)")))
        .and(body_json(json!({"content": "iVBORw0KGgo="})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({"webResourceId": "w-2", "webResourceContent": "iVBORw0KGgo="}),
    );

    let results = execute(&host, "webresource", "updateWebResource", 1).await.unwrap();
    assert_eq!(results[0].json, json!({"webresourceid": "w-2", "updated": true}));
}

#[tokio::test]
async fn test_list_web_resources_type_filter() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/webresourceset")))
        .and(query_param("$filter", "webresourcetype eq 3"))
        .and(query_param("$top", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"webresourceid": "w-1"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(&server.uri(), json!({"webResourceTypeFilter": 3}));
    let results = execute(&host, "webresource", "listWebResources", 1).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_register_webhook_endpoint_with_auth_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(api("/serviceendpoints")))
        .and(body_json(json!({
            "name": "orders-hook",
            "description": "Webhook endpoint: orders-hook",
            "contract": 8,
            "messageformat": 2,
            "url": "https://hooks.example.com/orders",
            "authtype": 4,
            "authvalue": "x-api-key: secret"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"serviceendpointid": "e-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({
            "endpointName": "orders-hook",
            "webhookUrl": "https://hooks.example.com/orders",
            "authHeader": "x-api-key: secret"
        }),
    );

    let results = execute(&host, "webhook", "registerEndpoint", 1).await.unwrap();
    assert_eq!(results[0].json["serviceendpointid"], "e-1");
    assert_eq!(results[0].json["authtype"], 4);
}

#[tokio::test]
async fn test_register_webhook_endpoint_without_id_fails() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(api("/serviceendpoints")))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({"endpointName": "n", "webhookUrl": "https://hooks.example.com"}),
    );

    let err = execute(&host, "webhook", "registerEndpoint", 1).await.unwrap_err();
    assert_eq!(
        err.source.to_string(),
        "Parse error: Failed to create service endpoint - no ID returned"
    );
}

#[tokio::test]
async fn test_register_webhook_step_is_async_post_operation() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/sdkmessagefilters")))
        .respond_with(ResponseTemplate::new(200).set_body_json(filter_rows()))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(api("/sdkmessageprocessingsteps")))
        .and(body_partial_json(json!({
            "name": "account Create Webhook",
            "mode": 1,
            "stage": 40,
            "asyncautodelete": true,
            "eventhandler_serviceendpoint@odata.bind": "/serviceendpoints(e-1)",
            "sdkmessagefilterid@odata.bind": "/sdkmessagefilters(f-create)"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"sdkmessageprocessingstepid": "s-7"})))
        .expect(1)
        .mount(&server)
        .await;

    let host = FakeHost::single(
        &server.uri(),
        json!({"table": "account", "serviceEndpointId": "e-1", "webhookOperation": "Create"}),
    );

    let results = execute(&host, "webhook", "registerWebhookStep", 1).await.unwrap();
    assert_eq!(results[0].json["sdkmessageid"], "m-create");
}

#[tokio::test]
async fn test_delete_webhook_endpoint_removes_steps_first() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api("/sdkmessageprocessingsteps")))
        .and(query_param(
            "$filter",
            "eventhandler_serviceendpoint/serviceendpointid eq e-1",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [
            {"sdkmessageprocessingstepid": "s-1"},
            {"sdkmessageprocessingstepid": "s-2"}
        ]})))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;

    let host = FakeHost::single(&server.uri(), json!({"serviceEndpointId": "e-1"}));

    let results = execute(&host, "webhook", "deleteEndpoint", 1).await.unwrap();
    assert_eq!(
        results[0].json,
        json!({"serviceendpointid": "e-1", "deleted": true, "stepsDeleted": 2})
    );

    let deletes: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == "DELETE")
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(
        deletes,
        vec![
            api("/sdkmessageprocessingsteps(s-1)"),
            api("/sdkmessageprocessingsteps(s-2)"),
            api("/serviceendpoints(e-1)"),
        ]
    );
}

#[tokio::test]
async fn test_webhook_step_rejects_unknown_message() {
    let host = FakeHost::single(
        "https://org.crm.dynamics.com",
        json!({"table": "account", "serviceEndpointId": "e-1", "webhookOperation": "Merge"}),
    );

    let err = execute(&host, "webhook", "registerWebhookStep", 1).await.unwrap_err();
    assert!(err.to_string().contains("Unsupported webhook operation: Merge"));
}
