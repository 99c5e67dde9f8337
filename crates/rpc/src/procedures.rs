//! The browser peer's procedure surface.
//!
//! The automation behind each procedure lives in the peer; this module only
//! fixes the closed set of names, how arguments travel, and typed wrappers
//! for both ends.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tabmesh_core::{Error, ExtraArgs, Result, TabKey, WindowKey};

use crate::client::{CallRequest, RpcClient};
use crate::server::{ProcedureError, ProcedurePath, Procedures};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserProcedure {
    PeerGetInfo,
    TabsList,
    TabsOpen,
    TabsClose,
    TabsCaptureScreenshot,
    DomQuerySelector,
    DomClickOnCoordinates,
    DomGetReadableTree,
}

impl ProcedurePath for BrowserProcedure {
    fn from_path(path: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.path() == path)
    }

    fn path(&self) -> &'static str {
        match self {
            BrowserProcedure::PeerGetInfo => "peer.getInfo",
            BrowserProcedure::TabsList => "tabs.list",
            BrowserProcedure::TabsOpen => "tabs.open",
            BrowserProcedure::TabsClose => "tabs.close",
            BrowserProcedure::TabsCaptureScreenshot => "tabs.captureScreenshot",
            BrowserProcedure::DomQuerySelector => "dom.querySelector",
            BrowserProcedure::DomClickOnCoordinates => "dom.clickOnCoordinates",
            BrowserProcedure::DomGetReadableTree => "dom.getReadableTree",
        }
    }

    fn all() -> &'static [Self] {
        &[
            BrowserProcedure::PeerGetInfo,
            BrowserProcedure::TabsList,
            BrowserProcedure::TabsOpen,
            BrowserProcedure::TabsClose,
            BrowserProcedure::TabsCaptureScreenshot,
            BrowserProcedure::DomQuerySelector,
            BrowserProcedure::DomClickOnCoordinates,
            BrowserProcedure::DomGetReadableTree,
        ]
    }
}

/// Zero-argument call every peer answers right after connecting.
pub const IDENTITY_PROCEDURE: BrowserProcedure = BrowserProcedure::PeerGetInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub tab_id: i64,
    pub window_id: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub window_id: i64,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub tabs: Vec<TabInfo>,
}

/// Self-reported identity of a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default)]
    pub windows: Vec<WindowInfo>,
}

impl PeerInfo {
    pub fn tab_count(&self) -> usize {
        self.windows.iter().map(|w| w.tabs.len()).sum()
    }

    pub fn find_tab(&self, tab_id: i64) -> Option<&TabInfo> {
        self.windows
            .iter()
            .flat_map(|w| w.tabs.iter())
            .find(|t| t.tab_id == tab_id)
    }

    /// Addresses of every tab in the inventory.
    pub fn tab_keys(&self) -> Vec<TabKey> {
        self.windows
            .iter()
            .flat_map(|w| w.tabs.iter())
            .filter_map(|t| TabKey::new(self.peer_id.clone(), Some(t.window_id), t.tab_id).ok())
            .collect()
    }
}

/// What a browser peer implements. Everything except identity is optional.
#[async_trait]
pub trait BrowserPeer: Send + Sync + 'static {
    async fn get_info(&self) -> std::result::Result<PeerInfo, ProcedureError>;

    async fn list_tabs(&self, _window_id: Option<i64>) -> std::result::Result<Vec<TabInfo>, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::TabsList.path()))
    }

    async fn open_tab(&self, _window_id: Option<i64>, _url: String) -> std::result::Result<TabInfo, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::TabsOpen.path()))
    }

    async fn close_tab(&self, _tab_id: i64) -> std::result::Result<(), ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::TabsClose.path()))
    }

    async fn capture_screenshot(&self, _tab_id: i64) -> std::result::Result<Value, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::TabsCaptureScreenshot.path()))
    }

    async fn query_selector(&self, _tab_id: i64, _selector: String) -> std::result::Result<Value, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::DomQuerySelector.path()))
    }

    async fn click_on_coordinates(&self, _tab_id: i64, _x: f64, _y: f64) -> std::result::Result<Value, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::DomClickOnCoordinates.path()))
    }

    async fn get_readable_tree(&self, _tab_id: i64) -> std::result::Result<Value, ProcedureError> {
        Err(ProcedureError::unsupported(BrowserProcedure::DomGetReadableTree.path()))
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> std::result::Result<T, ProcedureError> {
    let raw = args
        .get(index)
        .ok_or_else(|| ProcedureError::bad_args(format!("missing argument #{} ({})", index, name)))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| ProcedureError::bad_args(format!("argument #{} ({}): {}", index, name, e)))
}

fn target_tab(extra_args: &ExtraArgs) -> std::result::Result<i64, ProcedureError> {
    extra_args
        .tab_id
        .ok_or_else(|| ProcedureError::bad_args("extraArgs.tabId is required"))
}

fn to_json<T: Serialize>(value: T) -> std::result::Result<Value, ProcedureError> {
    serde_json::to_value(value).map_err(|e| ProcedureError::internal(e.to_string()))
}

/// Serves a [`BrowserPeer`] as a procedure table.
pub struct BrowserProcedures<P> {
    peer: Arc<P>,
}

impl<P: BrowserPeer> BrowserProcedures<P> {
    pub fn new(peer: Arc<P>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<P> {
        &self.peer
    }
}

#[async_trait]
impl<P: BrowserPeer> Procedures for BrowserProcedures<P> {
    type Procedure = BrowserProcedure;

    async fn invoke(
        &self,
        procedure: BrowserProcedure,
        args: Vec<Value>,
        extra_args: ExtraArgs,
    ) -> std::result::Result<Value, ProcedureError> {
        match procedure {
            BrowserProcedure::PeerGetInfo => {
                let mut info = self.peer.get_info().await?;
                if info.procedures.is_empty() {
                    info.procedures = BrowserProcedure::all()
                        .iter()
                        .map(|p| p.path().to_string())
                        .collect();
                }
                to_json(info)
            }
            BrowserProcedure::TabsList => to_json(self.peer.list_tabs(extra_args.window_id).await?),
            BrowserProcedure::TabsOpen => {
                let url: String = arg(&args, 0, "url")?;
                to_json(self.peer.open_tab(extra_args.window_id, url).await?)
            }
            BrowserProcedure::TabsClose => {
                self.peer.close_tab(target_tab(&extra_args)?).await?;
                Ok(Value::Null)
            }
            BrowserProcedure::TabsCaptureScreenshot => {
                self.peer.capture_screenshot(target_tab(&extra_args)?).await
            }
            BrowserProcedure::DomQuerySelector => {
                let selector: String = arg(&args, 0, "selector")?;
                self.peer.query_selector(target_tab(&extra_args)?, selector).await
            }
            BrowserProcedure::DomClickOnCoordinates => {
                let x: f64 = arg(&args, 0, "x")?;
                let y: f64 = arg(&args, 1, "y")?;
                self.peer.click_on_coordinates(target_tab(&extra_args)?, x, y).await
            }
            BrowserProcedure::DomGetReadableTree => {
                self.peer.get_readable_tree(target_tab(&extra_args)?).await
            }
        }
    }
}

/// Typed calls against one connected peer.
#[derive(Clone)]
pub struct PeerClient {
    peer_id: String,
    rpc: Arc<RpcClient>,
}

impl PeerClient {
    pub fn new(peer_id: impl Into<String>, rpc: Arc<RpcClient>) -> Self {
        Self {
            peer_id: peer_id.into(),
            rpc,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    fn ensure_owner(&self, peer_id: &str) -> Result<()> {
        if peer_id != self.peer_id {
            return Err(Error::Validation(format!(
                "key belongs to peer '{}', not '{}'",
                peer_id, self.peer_id
            )));
        }
        Ok(())
    }

    pub async fn call(&self, procedure: BrowserProcedure, args: Vec<Value>, extra_args: ExtraArgs) -> Result<Value> {
        self.rpc
            .call(
                CallRequest::new(procedure.path())
                    .with_args(args)
                    .with_extra_args(extra_args),
            )
            .await
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        procedure: BrowserProcedure,
        args: Vec<Value>,
        extra_args: ExtraArgs,
    ) -> Result<T> {
        let value = self.call(procedure, args, extra_args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_info(&self) -> Result<PeerInfo> {
        self.call_typed(IDENTITY_PROCEDURE, vec![], ExtraArgs::default()).await
    }

    pub async fn list_tabs(&self, window: &WindowKey) -> Result<Vec<TabInfo>> {
        self.ensure_owner(&window.peer_id)?;
        self.call_typed(BrowserProcedure::TabsList, vec![], ExtraArgs::for_window(window.window_id))
            .await
    }

    pub async fn open_tab(&self, window: &WindowKey, url: &str) -> Result<TabInfo> {
        self.ensure_owner(&window.peer_id)?;
        self.call_typed(
            BrowserProcedure::TabsOpen,
            vec![json!(url)],
            ExtraArgs::for_window(window.window_id),
        )
        .await
    }

    pub async fn close_tab(&self, tab: &TabKey) -> Result<()> {
        self.ensure_owner(&tab.peer_id)?;
        self.call(BrowserProcedure::TabsClose, vec![], tab_extra_args(tab))
            .await
            .map(|_| ())
    }

    pub async fn capture_screenshot(&self, tab: &TabKey) -> Result<Value> {
        self.ensure_owner(&tab.peer_id)?;
        self.call(BrowserProcedure::TabsCaptureScreenshot, vec![], tab_extra_args(tab))
            .await
    }

    pub async fn query_selector(&self, tab: &TabKey, selector: &str) -> Result<Value> {
        self.ensure_owner(&tab.peer_id)?;
        self.call(BrowserProcedure::DomQuerySelector, vec![json!(selector)], tab_extra_args(tab))
            .await
    }

    pub async fn click_on_coordinates(&self, tab: &TabKey, x: f64, y: f64) -> Result<Value> {
        self.ensure_owner(&tab.peer_id)?;
        self.call(
            BrowserProcedure::DomClickOnCoordinates,
            vec![json!(x), json!(y)],
            tab_extra_args(tab),
        )
        .await
    }

    pub async fn get_readable_tree(&self, tab: &TabKey) -> Result<Value> {
        self.ensure_owner(&tab.peer_id)?;
        self.call(BrowserProcedure::DomGetReadableTree, vec![], tab_extra_args(tab))
            .await
    }
}

fn tab_extra_args(tab: &TabKey) -> ExtraArgs {
    ExtraArgs {
        tab_id: Some(tab.tab_id),
        window_id: tab.window_id,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::server::RpcServer;

    struct StaticPeer;

    #[async_trait]
    impl BrowserPeer for StaticPeer {
        async fn get_info(&self) -> std::result::Result<PeerInfo, ProcedureError> {
            Ok(PeerInfo {
                peer_id: "peer-1".to_string(),
                name: "static".to_string(),
                version: "1.0.0".to_string(),
                procedures: vec![],
                windows: vec![WindowInfo {
                    window_id: 1,
                    focused: true,
                    tabs: vec![TabInfo {
                        tab_id: 10,
                        window_id: 1,
                        url: "https://example.com".to_string(),
                        title: "Example".to_string(),
                        active: true,
                    }],
                }],
            })
        }

        async fn click_on_coordinates(&self, tab_id: i64, x: f64, y: f64) -> std::result::Result<Value, ProcedureError> {
            Ok(json!({ "tabId": tab_id, "x": x, "y": y }))
        }
    }

    fn connected() -> (PeerClient, RpcServer<BrowserProcedures<StaticPeer>>) {
        let channel = MessageChannel::new();
        let rpc = Arc::new(RpcClient::new());
        rpc.bind_channel(channel.clone()).unwrap();
        let server = RpcServer::new(BrowserProcedures::new(Arc::new(StaticPeer)));
        server.start_listen(channel.reverse()).unwrap();
        (PeerClient::new("peer-1", rpc), server)
    }

    #[test]
    fn test_paths_are_unique_and_round_trip() {
        let mut seen = std::collections::HashSet::new();
        for procedure in BrowserProcedure::all() {
            assert!(seen.insert(procedure.path()));
            assert_eq!(BrowserProcedure::from_path(procedure.path()), Some(*procedure));
        }
        assert_eq!(BrowserProcedure::from_path("dom"), None);
    }

    #[tokio::test]
    async fn test_identity_lists_procedures_and_inventory() {
        let (client, _server) = connected();
        let info = client.get_info().await.unwrap();
        assert_eq!(info.peer_id, "peer-1");
        assert_eq!(info.procedures.len(), BrowserProcedure::all().len());
        assert_eq!(info.tab_count(), 1);
        assert_eq!(info.find_tab(10).map(|t| t.url.as_str()), Some("https://example.com"));
        assert_eq!(info.tab_keys()[0].to_string(), "peer-1:1:10");
    }

    #[tokio::test]
    async fn test_tab_key_routes_through_extra_args() {
        let (client, _server) = connected();
        let tab = TabKey::parse("peer-1:1:10").unwrap();
        let result = client.click_on_coordinates(&tab, 5.0, 6.5).await.unwrap();
        assert_eq!(result, json!({ "tabId": 10, "x": 5.0, "y": 6.5 }));
    }

    #[tokio::test]
    async fn test_unimplemented_procedure_reports_unsupported() {
        let (client, _server) = connected();
        let tab = TabKey::new("peer-1", Some(1), 10).unwrap();
        let err = client.capture_screenshot(&tab).await.unwrap_err();
        let remote = match err {
            Error::Remote(value) => ProcedureError::from_remote(&value).unwrap(),
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(remote.code, ProcedureError::UNSUPPORTED);
    }

    #[tokio::test]
    async fn test_missing_tab_id_is_bad_args() {
        let (client, _server) = connected();
        let err = client
            .call(BrowserProcedure::DomClickOnCoordinates, vec![json!(1), json!(2)], ExtraArgs::default())
            .await
            .unwrap_err();
        let remote = ProcedureError::from_remote(match &err {
            Error::Remote(value) => value,
            other => panic!("unexpected error {:?}", other),
        })
        .unwrap();
        assert_eq!(remote.code, ProcedureError::BAD_ARGS);
    }

    #[tokio::test]
    async fn test_key_for_other_peer_is_rejected_locally() {
        let (client, _server) = connected();
        let foreign = TabKey::new("peer-2", Some(1), 10).unwrap();
        let err = client.get_readable_tree(&foreign).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(client.rpc().pending_count(), 0);
    }
}
