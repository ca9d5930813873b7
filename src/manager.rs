use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bridge_core::{
    Client, CommandConfig, Converter, Dispatcher, Endpoint, HandleMap, Listen, Server,
    ServerOptions, UnifiedConverter,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{
    EventAck, FollowLogParams, GetLogParams, HandleNoticeParams, ManagerMethod, params,
};
use crate::config::BridgeConfig;
use crate::logger::LogHub;
use crate::notice::NoticeBoard;

/// Time a `stop` reply gets to reach the caller before sessions are torn down.
const STOP_GRACE: Duration = Duration::from_millis(100);

/// Process-wide coordinator: one listening server, the log hub, the notice
/// board and the dispatch pipeline implementations feed events into.
#[derive(Clone, Debug)]
pub struct Manager {
    server: Server,
    logs: Arc<LogHub>,
    notices: Arc<NoticeBoard>,
    dispatcher: Dispatcher,
    stop: CancellationToken,
}

impl Manager {
    pub async fn start(config: &BridgeConfig, logs: Arc<LogHub>) -> Result<Manager> {
        Self::bind(config.listen()?, config.server_options(), config.command_config(), logs).await
    }

    pub async fn bind(
        listen: Listen,
        options: ServerOptions,
        command: CommandConfig,
        logs: Arc<LogHub>,
    ) -> Result<Manager> {
        let notices = Arc::new(NoticeBoard::new());
        let dispatcher = Dispatcher::new(command);
        let stop = CancellationToken::new();
        let handles = operator_handles(&logs, &notices, &dispatcher, &stop);

        let server = Server::bind(listen.clone(), options, handles)
            .await
            .with_context(|| format!("cannot listen on {listen}"))?;
        info!(addr = %server.local_addr(), "manager started");

        Ok(Manager { server, logs, notices, dispatcher, stop })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn endpoint(&self) -> Endpoint {
        self.server.endpoint()
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    pub fn notices(&self) -> &Arc<NoticeBoard> {
        &self.notices
    }

    /// Plugins register their callbacks here.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Extra call names served to every session, next to the operator ones.
    pub fn handles(&self) -> &HandleMap {
        self.server.handles()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once a stop was requested, locally or by a peer, and every
    /// session has been closed.
    pub async fn wait(&self) {
        self.stop.cancelled().await;
        tokio::time::sleep(STOP_GRACE).await;
        info!(sessions = self.server.len(), "manager stopping");
        self.server.close();
    }
}

fn operator_handles(
    logs: &Arc<LogHub>,
    notices: &Arc<NoticeBoard>,
    dispatcher: &Dispatcher,
    stop: &CancellationToken,
) -> HandleMap {
    let handles = HandleMap::new();

    let token = stop.clone();
    let handles = handles.with(ManagerMethod::Stop.to_string(), move |_args, client: Client| {
        let token = token.clone();
        async move {
            info!(session = %client.id(), peer = %client.peer().name, "stop requested");
            token.cancel();
            Ok(Value::Null)
        }
    });

    let hub = logs.clone();
    let handles = handles.with(ManagerMethod::GetLog.to_string(), move |args, _client| {
        let hub = hub.clone();
        async move {
            let p: GetLogParams = params(ManagerMethod::GetLog, args)?;
            Ok(serde_json::to_value(hub.recent(p.level, p.time, p.lines))?)
        }
    });

    let hub = logs.clone();
    let handles = handles.with(ManagerMethod::FollowLog.to_string(), move |args, client: Client| {
        let hub = hub.clone();
        async move {
            let p: FollowLogParams = params(ManagerMethod::FollowLog, args)?;
            hub.follow(&client, p.level);
            Ok(Value::Null)
        }
    });

    let hub = logs.clone();
    let handles = handles.with(ManagerMethod::UnfollowLog.to_string(), move |_args, client: Client| {
        let hub = hub.clone();
        async move { Ok(json!(hub.unfollow(client.id()))) }
    });

    let board = notices.clone();
    let handles = handles.with(ManagerMethod::ListNotice.to_string(), move |_args, _client| {
        let board = board.clone();
        async move { Ok(serde_json::to_value(board.list())?) }
    });

    let board = notices.clone();
    let handles = handles.with(ManagerMethod::HandleNotice.to_string(), move |args, client: Client| {
        let board = board.clone();
        async move {
            let p: HandleNoticeParams = params(ManagerMethod::HandleNotice, args)?;
            board.handle(&p.id, p.data)?;
            info!(notice = %p.id, session = %client.id(), "notice answered remotely");
            Ok(Value::Null)
        }
    });

    let pipeline = dispatcher.clone();
    handles.with(ManagerMethod::Event.to_string(), move |args, client: Client| {
        let pipeline = pipeline.clone();
        async move {
            let converter = UnifiedConverter::new(client.peer().name.clone());
            let event = converter.convert(args).await.inspect_err(|err| {
                warn!(session = %client.id(), error = %err, "rejected event");
            })?;
            let consumed = pipeline.handle(event, &client).await;
            Ok(serde_json::to_value(EventAck { consumed })?)
        }
    })
}
