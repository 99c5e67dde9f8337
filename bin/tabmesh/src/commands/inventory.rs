//! In-memory tab inventory served by `tabmesh peer`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tabmesh_rpc::{BrowserPeer, PeerInfo, ProcedureError, TabInfo, WindowInfo};

pub struct StaticInventoryPeer {
    peer_id: String,
    name: String,
    windows: Mutex<Vec<WindowInfo>>,
    next_tab_id: Mutex<i64>,
}

impl StaticInventoryPeer {
    pub fn new(peer_id: impl Into<String>, name: impl Into<String>) -> Self {
        let windows = vec![WindowInfo {
            window_id: 1,
            focused: true,
            tabs: vec![TabInfo {
                tab_id: 1,
                window_id: 1,
                url: "about:blank".to_string(),
                title: "New Tab".to_string(),
                active: true,
            }],
        }];
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            windows: Mutex::new(windows),
            next_tab_id: Mutex::new(2),
        }
    }

    fn with_tab<T>(&self, tab_id: i64, f: impl FnOnce(&TabInfo) -> T) -> Result<T, ProcedureError> {
        self.windows
            .lock()
            .iter()
            .flat_map(|w| w.tabs.iter())
            .find(|t| t.tab_id == tab_id)
            .map(f)
            .ok_or_else(|| ProcedureError::failed(format!("no tab with id {}", tab_id)))
    }
}

#[async_trait]
impl BrowserPeer for StaticInventoryPeer {
    async fn get_info(&self) -> Result<PeerInfo, ProcedureError> {
        Ok(PeerInfo {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            procedures: vec![],
            windows: self.windows.lock().clone(),
        })
    }

    async fn list_tabs(&self, window_id: Option<i64>) -> Result<Vec<TabInfo>, ProcedureError> {
        Ok(self
            .windows
            .lock()
            .iter()
            .filter(|w| window_id.map(|id| id == w.window_id).unwrap_or(true))
            .flat_map(|w| w.tabs.iter().cloned())
            .collect())
    }

    async fn open_tab(&self, window_id: Option<i64>, url: String) -> Result<TabInfo, ProcedureError> {
        let tab_id = {
            let mut next = self.next_tab_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let mut windows = self.windows.lock();
        let window = match window_id {
            Some(id) => windows
                .iter_mut()
                .find(|w| w.window_id == id)
                .ok_or_else(|| ProcedureError::failed(format!("no window with id {}", id)))?,
            None => windows
                .iter_mut()
                .find(|w| w.focused)
                .ok_or_else(|| ProcedureError::failed("no focused window"))?,
        };
        for tab in &mut window.tabs {
            tab.active = false;
        }
        let tab = TabInfo {
            tab_id,
            window_id: window.window_id,
            title: url.clone(),
            url,
            active: true,
        };
        window.tabs.push(tab.clone());
        Ok(tab)
    }

    async fn close_tab(&self, tab_id: i64) -> Result<(), ProcedureError> {
        let mut windows = self.windows.lock();
        for window in windows.iter_mut() {
            if let Some(pos) = window.tabs.iter().position(|t| t.tab_id == tab_id) {
                window.tabs.remove(pos);
                return Ok(());
            }
        }
        Err(ProcedureError::failed(format!("no tab with id {}", tab_id)))
    }

    async fn get_readable_tree(&self, tab_id: i64) -> Result<Value, ProcedureError> {
        self.with_tab(tab_id, |tab| {
            json!({
                "role": "document",
                "name": tab.title,
                "url": tab.url,
                "children": [],
            })
        })
    }
}
