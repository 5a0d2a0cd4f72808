//! Calls between a hosting registry and a stub found through discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pubsub_rpc::{
    Error, LocalBus, LocalNode, MethodRouter, Node, Request, Service, ServiceDescription,
    ServiceError, ServiceFilter, ServiceHandle, ServiceRegistry, ServiceStub, StubConfig,
    TypedPayload,
};
use tracing::info;

#[derive(Clone, PartialEq, prost::Message)]
struct EchoRequest {
    #[prost(string, tag = "1")]
    text: String,
    #[prost(uint32, tag = "2")]
    seq: u32,
}

impl prost::Name for EchoRequest {
    const NAME: &'static str = "EchoRequest";
    const PACKAGE: &'static str = "test";
}

#[derive(Clone, PartialEq, prost::Message)]
struct Nap {
    #[prost(uint64, tag = "1")]
    millis: u64,
}

impl prost::Name for Nap {
    const NAME: &'static str = "Nap";
    const PACKAGE: &'static str = "test";
}

fn echo_router() -> MethodRouter {
    MethodRouter::new("Echo")
        .method("echo", |req: EchoRequest| async move { Ok(req) })
        .method("fail", |req: EchoRequest| async move {
            Err::<EchoRequest, _>(ServiceError::internal(format!("refusing '{}'", req.text)))
        })
        .method("nap", |req: Nap| async move {
            tokio::time::sleep(Duration::from_millis(req.millis)).await;
            Ok(req)
        })
}

struct Pair {
    server: ServiceRegistry,
    server_node: Arc<LocalNode>,
    service: ServiceHandle,
    stub: ServiceStub,
}

async fn pair(config: StubConfig) -> anyhow::Result<Pair> {
    let bus = LocalBus::new();
    let server_node = bus.node();
    let server = ServiceRegistry::builder()
        .node(server_node.clone())
        .build()
        .await?;
    let client = ServiceRegistry::builder().node(bus.node()).build().await?;

    let service = ServiceHandle::new(echo_router());
    server
        .add_service(&service, ServiceDescription::default())
        .await?;

    let desc = client
        .find(&ServiceFilter::new("Echo"))
        .await
        .ok_or_else(|| anyhow::anyhow!("Echo not found"))?;
    info!(channel = %desc.channel(), "found echo service");
    let stub = ServiceStub::connect_with(&desc, config).await?;
    Ok(Pair {
        server,
        server_node,
        service,
        stub,
    })
}

fn quick() -> StubConfig {
    StubConfig {
        call_timeout: Duration::from_secs(2),
        bind_timeout: Duration::from_secs(2),
    }
}

#[test_log::test(tokio::test)]
async fn echo_round_trip() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;
    let request = EchoRequest {
        text: "hello".into(),
        seq: 1,
    };
    let reply: EchoRequest = pair.stub.call("echo", &request).await?;
    assert_eq!(reply, request);
    assert_eq!(pair.stub.service_name(), "Echo");
    assert_eq!(pair.stub.channel(), pair.service.channel());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_calls_get_their_own_replies() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;

    let calls: Vec<_> = (0..32u32)
        .map(|seq| {
            let stub = pair.stub.clone();
            tokio::spawn(async move {
                let request = EchoRequest {
                    text: format!("call-{seq}"),
                    seq,
                };
                let reply: EchoRequest = stub.call("echo", &request).await?;
                Ok::<_, Error>((request, reply))
            })
        })
        .collect();

    for call in calls {
        let (request, reply) = call.await??;
        assert_eq!(reply, request);
    }
    assert_eq!(pair.stub.pending_calls(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failures_come_back_typed() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;
    let request = EchoRequest {
        text: "x".into(),
        seq: 0,
    };

    let err = pair
        .stub
        .call::<_, EchoRequest>("missing", &request)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { ref code, .. } if code == "unknown_method"));

    let err = pair
        .stub
        .call::<_, EchoRequest>("fail", &request)
        .await
        .unwrap_err();
    match err {
        Error::Remote { code, message } => {
            assert_eq!(code, "internal");
            assert_eq!(message, "refusing 'x'");
        }
        other => panic!("expected remote failure, got {other:?}"),
    }

    let err = pair
        .stub
        .call::<_, EchoRequest>("echo", &Nap { millis: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote { ref code, .. } if code == "bad_request"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn slow_method_times_out() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;
    let err = pair
        .stub
        .call_timeout::<_, Nap>("nap", &Nap { millis: 500 }, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(pair.stub.pending_calls(), 0);

    // the late reply is dropped and the stub keeps working
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply: Nap = pair.stub.call("nap", &Nap { millis: 1 }).await?;
    assert_eq!(reply.millis, 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn departed_host_looks_like_a_timeout() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;
    pair.server_node.disconnect();

    let err = pair
        .stub
        .call_timeout::<_, EchoRequest>("echo", &EchoRequest::default(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn removed_service_stops_answering() -> anyhow::Result<()> {
    let pair = pair(quick()).await?;
    assert!(pair.server.remove_service(&pair.service).await?);

    let err = pair
        .stub
        .call_timeout::<_, EchoRequest>("echo", &EchoRequest::default(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn bound_callers_do_not_keep_a_removed_service_alive() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let server = ServiceRegistry::builder().node(bus.node()).build().await?;
    let client = ServiceRegistry::builder().node(bus.node()).build().await?;

    let service = ServiceHandle::new(echo_router());
    server
        .add_service(&service, ServiceDescription::default())
        .await?;
    let desc = client
        .find(&ServiceFilter::new("Echo"))
        .await
        .ok_or_else(|| anyhow::anyhow!("Echo not found"))?;

    let other_caller: Node = bus.node();
    let _early = ServiceStub::with_nodes(&desc, vec![other_caller], quick()).await?;
    server.remove_service(&service).await?;

    let late = StubConfig {
        bind_timeout: Duration::from_millis(200),
        ..quick()
    };
    let err = ServiceStub::connect_with(&desc, late).await.unwrap_err();
    assert!(matches!(err, Error::NoSubscribers(_)));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stub_needs_a_bound_description() {
    let desc = ServiceDescription::new("Echo", "somewhere");
    let err = ServiceStub::connect(&desc).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

/// Answers every call with the request's type tag and the reply type the
/// caller asked for, decoding nothing itself.
struct TagReporter;

#[async_trait]
impl Service for TagReporter {
    fn name(&self) -> &str {
        "Tags"
    }

    async fn call_method(&self, request: Request) -> Result<TypedPayload, ServiceError> {
        Ok(TypedPayload::encode(&EchoRequest {
            text: format!(
                "{}>{}",
                request.payload().type_tag,
                request.reply_type().unwrap_or("")
            ),
            seq: request.payload().bytes.len() as u32,
        }))
    }
}

#[test_log::test(tokio::test)]
async fn hand_written_services_see_raw_payloads() -> anyhow::Result<()> {
    let bus = LocalBus::new();
    let server = ServiceRegistry::builder().node(bus.node()).build().await?;
    let client = ServiceRegistry::builder().node(bus.node()).build().await?;

    let service = ServiceHandle::new(TagReporter);
    server
        .add_service(&service, ServiceDescription::default())
        .await?;

    let desc = client
        .find(&ServiceFilter::new("Tags"))
        .await
        .ok_or_else(|| anyhow::anyhow!("Tags not found"))?;
    let stub = ServiceStub::connect_with(&desc, quick()).await?;

    let reply: EchoRequest = stub.call("anything", &Nap { millis: 300 }).await?;
    assert_eq!(reply.text, "test.Nap>test.EchoRequest");
    assert!(reply.seq > 0);
    stub.close().await;
    Ok(())
}
