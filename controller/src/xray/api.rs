//! xray gRPC 管理通道客户端
//!
//! 直接用 tonic 的通用 unary 调用 HandlerService / StatsService，
//! 消息定义在 `common::grpc::xray`。

use std::time::Duration;

use async_trait::async_trait;
use common::error::ConnError;
use common::grpc::xray::{
    add_user_request, remove_user_request, AlterInboundResponse, QueryStatsRequest,
    QueryStatsResponse, RemoveInboundRequest, RemoveInboundResponse, ALTER_INBOUND_PATH,
    QUERY_STATS_PATH, REMOVE_INBOUND_PATH,
};
use common::protocol::control::{LiveControl, LiveControlConnector, LiveUser};
use common::protocol::traffic::TrafficReport;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tracing::debug;

/// 已连接的 xray 管理通道
pub struct XrayApi {
    channel: Channel,
}

impl XrayApi {
    /// 连接 127.0.0.1 上的管理端口，连接与每次调用都受 timeout 限制
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self, ConnError> {
        if port == 0 {
            return Err(ConnError::InvalidPort(port));
        }

        let channel = Channel::from_shared(format!("http://127.0.0.1:{}", port))
            .map_err(|e| ConnError::Unreachable(e.to_string()))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect()
            .await
            .map_err(|e| ConnError::Unreachable(format!("127.0.0.1:{}: {}", port, e)))?;

        debug!("已连接 xray 管理通道 127.0.0.1:{}", port);
        Ok(Self { channel })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, ConnError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ConnError::Unreachable(e.to_string()))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|status| ConnError::RpcFailed(format!("{}: {}", path, status.message())))?;

        Ok(response.into_inner())
    }
}

#[async_trait]
impl LiveControl for XrayApi {
    async fn add_user(&self, inbound_tag: &str, user: &LiveUser) -> Result<(), ConnError> {
        let _: AlterInboundResponse = self
            .unary(ALTER_INBOUND_PATH, add_user_request(inbound_tag, user))
            .await?;
        Ok(())
    }

    async fn remove_user(&self, inbound_tag: &str, email: &str) -> Result<(), ConnError> {
        let _: AlterInboundResponse = self
            .unary(ALTER_INBOUND_PATH, remove_user_request(inbound_tag, email))
            .await?;
        Ok(())
    }

    async fn remove_inbound(&self, tag: &str) -> Result<(), ConnError> {
        let _: RemoveInboundResponse = self
            .unary(
                REMOVE_INBOUND_PATH,
                RemoveInboundRequest {
                    tag: tag.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn query_traffic(&self, reset: bool) -> Result<TrafficReport, ConnError> {
        let response: QueryStatsResponse = self
            .unary(
                QUERY_STATS_PATH,
                QueryStatsRequest {
                    pattern: String::new(),
                    reset,
                },
            )
            .await?;

        Ok(TrafficReport::from_stats(
            response.stat.into_iter().map(|stat| (stat.name, stat.value)),
        ))
    }

    fn disconnect(self: Box<Self>) {
        // channel 随 drop 关闭
        drop(self);
    }
}

/// 按端口创建 [`XrayApi`] 连接
#[derive(Debug, Clone)]
pub struct XrayApiConnector {
    timeout: Duration,
}

impl XrayApiConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LiveControlConnector for XrayApiConnector {
    async fn connect(&self, api_port: u16) -> Result<Box<dyn LiveControl>, ConnError> {
        let api = XrayApi::connect(api_port, self.timeout).await?;
        Ok(Box::new(api))
    }
}
