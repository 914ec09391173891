#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use uiprobe::{
    AutomationServer, Bounds, Component, Desktop, MessageLoop, ProbeClient, ScriptEngine,
    ScriptError, ScriptScope, ServerConfig, Services, TypeRegistry,
};

pub struct Window {
    pub id: String,
    pub children: Vec<Arc<dyn Component>>,
}

impl Component for Window {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_visible(&self) -> bool {
        true
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        }
    }

    fn children(&self) -> Vec<Arc<dyn Component>> {
        self.children.clone()
    }
}

pub struct PushButton {
    pub id: String,
    pub visible: bool,
    pub presses: AtomicUsize,
    pub releases: AtomicUsize,
}

impl PushButton {
    pub fn new(id: &str, visible: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            visible,
            presses: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn clicks(&self) -> (usize, usize) {
        (self.presses.load(Ordering::SeqCst), self.releases.load(Ordering::SeqCst))
    }
}

impl Component for PushButton {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        format!("{} button", self.id)
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            x: 20,
            y: 40,
            width: 100,
            height: 24,
        }
    }

    fn children(&self) -> Vec<Arc<dyn Component>> {
        Vec::new()
    }

    fn press(&self) {
        self.presses.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn render_png(&self, _with_children: bool) -> Option<Vec<u8>> {
        Some(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }
}

pub struct Screen(pub Vec<Arc<dyn Component>>);

impl Desktop for Screen {
    fn windows(&self) -> Vec<Arc<dyn Component>> {
        self.0.clone()
    }
}

/// Scripts of the form `raise <message>` fail with that message.
pub struct EchoEngine {
    pub seen: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl ScriptEngine for EchoEngine {
    fn run(&mut self, source: &str, scope: &ScriptScope<'_>) -> Result<(), ScriptError> {
        self.seen
            .lock()
            .unwrap()
            .push((source.to_string(), scope.modules.to_vec()));
        match source.strip_prefix("raise ") {
            Some(message) => Err(ScriptError::Script(message.trim().to_string())),
            None => Ok(()),
        }
    }
}

pub struct Harness {
    pub server: AutomationServer,
    pub ok: Arc<PushButton>,
    pub hidden: Arc<PushButton>,
    pub scripts: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    pub run_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {}, true)
    }

    pub fn with_config(tweak: impl FnOnce(&mut ServerConfig), scripting: bool) -> Self {
        let run_dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            run_file_dir: Some(run_dir.path().to_path_buf()),
            ..Default::default()
        };
        tweak(&mut config);

        let ok = PushButton::new("ok", true);
        let hidden = PushButton::new("hidden", false);
        let window = Arc::new(Window {
            id: "main".to_string(),
            children: vec![ok.clone() as Arc<dyn Component>, hidden.clone() as Arc<dyn Component>],
        });

        let scripts = Arc::new(Mutex::new(Vec::new()));
        let engine: Option<Box<dyn ScriptEngine>> = scripting.then(|| {
            Box::new(EchoEngine {
                seen: scripts.clone(),
            }) as Box<dyn ScriptEngine>
        });

        let ui = MessageLoop::from_config(&config).unwrap();
        let server = AutomationServer::new(
            config,
            Services {
                types: Arc::new(TypeRegistry::new()),
                ui: Arc::new(ui),
                desktop: Arc::new(Screen(vec![window as Arc<dyn Component>])),
                scripts: engine,
            },
        );

        Self {
            server,
            ok,
            hidden,
            scripts,
            run_dir,
        }
    }

    /// Start on an OS-assigned port and return a client for it.
    pub fn start(&self) -> ProbeClient {
        let port = self.server.start(Some(0)).unwrap();
        client(port)
    }
}

pub fn client(port: u16) -> ProbeClient {
    ProbeClient::new(SocketAddr::from(([127, 0, 0, 1], port))).with_timeout(Duration::from_secs(10))
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
