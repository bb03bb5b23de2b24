#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ensign::auth::Validator;
use ensign::{Config, Server, ServerError};
use ensign_api::health::v1::health_client::HealthClient;
use ensign_api::v1beta1::ensign_client::EnsignClient;
use ensign_api::v1beta1::Topic;
use ensign_store::Store;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Request;
use ulid::Ulid;

const PRIVATE_KEY: &str = include_str!("../fixtures/rsa-private.pem");
const JWKS: &str = include_str!("../fixtures/jwks.json");
const KID: &str = "ensign-test-key";
const AUDIENCE: &str = "https://ensign.test";
const ISSUER: &str = "https://auth.ensign.test";

pub const PROJECT: &str = "01GQ7P8DNR9MR64RJR9D64FFNT";

pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    pub async fn start_with(mut conf: Config) -> Self {
        conf.storage.testing = true;
        conf.monitoring.enabled = false;
        conf.auth.audience = AUDIENCE.into();
        conf.auth.issuer = ISSUER.into();

        let store = Arc::new(Store::in_memory(conf.storage.read_only));
        let jwks = serde_json::from_str(JWKS).unwrap();
        let validator = Arc::new(Validator::with_keys(jwks, AUDIENCE, ISSUER));
        let server = Arc::new(Server::with_authenticator(conf, store, validator));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_with_listener(listener).await })
        };

        for _ in 0..100 {
            if server.node().health().is_serving() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Self { server, addr, task }
    }

    pub async fn client(&self) -> EnsignClient<Channel> {
        EnsignClient::connect(format!("http://{}", self.addr)).await.unwrap()
    }

    pub async fn health(&self) -> HealthClient<Channel> {
        HealthClient::connect(format!("http://{}", self.addr)).await.unwrap()
    }

    pub async fn stop(self) {
        self.server.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

/// Sign an access token for the test project with the given permissions.
pub fn token(permissions: &[&str]) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "sub": "01GWJCC9RSD0R11YT5C7QP6XRF",
        "aud": AUDIENCE,
        "iss": ISSUER,
        "iat": now,
        "nbf": now - 60,
        "exp": now + 600,
        "project": PROJECT,
        "permissions": permissions,
    });

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

pub fn authorized<T>(msg: T, token: &str) -> Request<T> {
    let mut req = Request::new(msg);
    let value: MetadataValue<Ascii> = format!("Bearer {token}").parse().unwrap();
    req.metadata_mut().insert("authorization", value);
    req
}

pub async fn create_topic(client: &mut EnsignClient<Channel>, name: &str) -> Topic {
    let topic = Topic {
        project_id: Ulid::from_string(PROJECT).unwrap().to_bytes().to_vec(),
        name: name.into(),
        ..Default::default()
    };
    client
        .create_topic(authorized(topic, &token(&["topics:create"])))
        .await
        .unwrap()
        .into_inner()
}
