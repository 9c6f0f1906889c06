//! PveClient requests against a mock Proxmox VE API.

use mvirt_lxc::config::GatewayConfig;
use mvirt_lxc::error::GatewayError;
use mvirt_lxc::gateway::{ContainerGateway, PveClient};
use mvirt_lxc::types::{
    ContainerIdentity, ContainerSpec, DeleteOptions, ExecutionState, Features, NetworkSpec,
    ObservedStatus, Status,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH: &str = "PVEAPIToken=terraform@pve!ci=3f1c-secret";

fn make_client(server: &MockServer) -> PveClient {
    let config = GatewayConfig::new(server.uri(), "terraform@pve", "ci", "3f1c-secret");
    PveClient::new(&config).unwrap()
}

fn identity() -> ContainerIdentity {
    ContainerIdentity::new("pve1", 105)
}

fn data(value: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": value }))
}

#[tokio::test]
async fn test_status_sends_token_and_reads_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/current"))
        .and(header("Authorization", AUTH))
        .respond_with(data(json!({ "status": "running", "vmid": 105 })))
        .expect(1)
        .mount(&server)
        .await;

    let status = make_client(&server).status(&identity()).await.unwrap();
    assert_eq!(status, ObservedStatus::Running);
}

#[tokio::test]
async fn test_cloudflare_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/current"))
        .and(header("CF-Access-Client-Id", "cf-id"))
        .and(header("CF-Access-Client-Secret", "cf-secret"))
        .respond_with(data(json!({ "status": "stopped" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = GatewayConfig::new(server.uri(), "terraform@pve", "ci", "3f1c-secret");
    config.cf_client_id = Some("cf-id".into());
    config.cf_client_secret = Some("cf-secret".into());
    let client = PveClient::new(&config).unwrap();

    assert_eq!(
        client.status(&identity()).await.unwrap(),
        ObservedStatus::Stopped
    );
}

#[tokio::test]
async fn test_missing_container_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/current"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string("Configuration file 'nodes/pve1/lxc/105.conf' does not exist"),
        )
        .mount(&server)
        .await;

    let err = make_client(&server).status(&identity()).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)), "{err}");
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/start"))
        .respond_with(ResponseTemplate::new(503).set_body_string("proxy loop"))
        .mount(&server)
        .await;

    let err = make_client(&server).start(&identity()).await.unwrap_err();
    assert_eq!(
        err,
        GatewayError::Api {
            status: 503,
            message: "proxy loop".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_stop_with_overrule() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/stop"))
        .and(body_string_contains("overrule-shutdown=1"))
        .respond_with(data(json!("UPID:pve1:0000:vzstop:105:root@pam:")))
        .expect(1)
        .mount(&server)
        .await;

    make_client(&server).stop(&identity(), true).await.unwrap();
}

#[tokio::test]
async fn test_interfaces_strip_prefix_length() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc/105/interfaces"))
        .respond_with(data(json!([
            { "name": "lo", "hwaddr": "00:00:00:00:00:00", "inet": "127.0.0.1/8", "inet6": "::1/128" },
            { "name": "eth0", "hwaddr": "bc:24:11:aa:bb:cc", "inet": "10.0.0.5/24" },
            { "name": "eth1", "hwaddr": "bc:24:11:dd:ee:ff" }
        ])))
        .mount(&server)
        .await;

    let interfaces = make_client(&server).interfaces(&identity()).await.unwrap();
    assert_eq!(interfaces.len(), 3);
    assert_eq!(interfaces[0].ipv6, "::1");
    assert_eq!(interfaces[1].name, "eth0");
    assert_eq!(interfaces[1].ipv4, "10.0.0.5");
    assert_eq!(interfaces[1].hwaddr, "bc:24:11:aa:bb:cc");
    assert_eq!(interfaces[2].ipv4, "");
}

#[tokio::test]
async fn test_create_form_encoding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/lxc"))
        .and(body_string_contains("vmid=105"))
        .and(body_string_contains("hostname=web-1"))
        .and(body_string_contains("features=nesting%3D1"))
        .and(body_string_contains(
            "net0=name%3Deth0%2Cbridge%3Dvmbr0%2Cfirewall%3D1%2Cip%3Ddhcp",
        ))
        .and(body_string_contains("net1=name%3Deth1%2Cbridge%3Dvmbr1%2Ctag%3D20"))
        .respond_with(data(json!("UPID:pve1:0000:vzcreate:105:root@pam:")))
        .expect(1)
        .mount(&server)
        .await;

    let spec = ContainerSpec {
        node: "pve1".into(),
        id: Some(105),
        template: "local:vztmpl/debian-12.tar.zst".into(),
        hostname: Some("web-1".into()),
        password: None,
        ssh_public_keys: vec![],
        nameserver: None,
        on_boot: None,
        unprivileged: Some(true),
        features: Features {
            nesting: Some(true),
            ..Default::default()
        },
        root_fs: None,
        networks: vec![
            NetworkSpec {
                bridge: Some("vmbr0".into()),
                firewall: Some(true),
                ip: Some("dhcp".into()),
                ..NetworkSpec::named("eth0")
            },
            NetworkSpec {
                bridge: Some("vmbr1".into()),
                vlan_tag: Some(20),
                ..NetworkSpec::named("eth1")
            },
        ],
        commands: vec![],
        status: Status::Running,
    };

    make_client(&server).create(105, &spec).await.unwrap();
}

#[tokio::test]
async fn test_delete_query_flags() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api2/json/nodes/pve1/lxc/105"))
        .and(query_param("purge", "1"))
        .and(query_param("force", "0"))
        .and(query_param("destroy-unreferenced-disks", "1"))
        .respond_with(data(json!("UPID:pve1:0000:vzdestroy:105:root@pam:")))
        .expect(1)
        .mount(&server)
        .await;

    let options = DeleteOptions {
        purge: true,
        force: false,
        destroy_unreferenced_disks: true,
    };
    make_client(&server)
        .delete(&identity(), &options)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_allocate_id_accepts_string() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(data(json!("118")))
        .mount(&server)
        .await;

    assert_eq!(make_client(&server).allocate_id().await.unwrap(), 118);
}

#[tokio::test]
async fn test_id_availability_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .and(query_param("vmid", "120"))
        .respond_with(data(json!(120)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .and(query_param("vmid", "105"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "errors": { "vmid": "VM 105 already exists" } })),
        )
        .mount(&server)
        .await;

    let client = make_client(&server);
    assert!(client.is_id_available(120).await.unwrap());
    assert!(!client.is_id_available(105).await.unwrap());
}

#[tokio::test]
async fn test_update_networks_puts_config() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api2/json/nodes/pve1/lxc/105/config"))
        .and(body_string_contains("net0=name%3Deth0"))
        .respond_with(data(json!(null)))
        .expect(1)
        .mount(&server)
        .await;

    make_client(&server)
        .update_networks(&identity(), &[NetworkSpec::named("eth0")])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exec_submit_and_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/custom-api/v1/lxc/105/exec-async"))
        .and(header("Authorization", AUTH))
        .and(body_string_contains(r#""shell":"bash""#))
        .respond_with(data(json!({ "id": "4c1d7a" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/custom-api/v1/exec/4c1d7a"))
        .respond_with(data(json!({
            "id": "4c1d7a",
            "status": "SUCCEEDED",
            "exitCode": 2,
            "output": "ls: cannot access '/nope'"
        })))
        .mount(&server)
        .await;

    let client = make_client(&server);
    let execution_id = client
        .exec_async(&identity(), "bash", "ls /nope")
        .await
        .unwrap();
    assert_eq!(execution_id, "4c1d7a");

    let record = client.execution_result(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionState::Succeeded);
    assert_eq!(record.exit_code, Some(2));
    assert_eq!(record.output.as_deref(), Some("ls: cannot access '/nope'"));
}

#[tokio::test]
async fn test_undecodable_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/lxc/105/status/current"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = make_client(&server).status(&identity()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Decode(_)), "{err}");
}

#[test]
fn test_invalid_config_rejected() {
    let config = GatewayConfig::new("", "terraform@pve", "ci", "secret");
    assert!(PveClient::new(&config).is_err());
}
