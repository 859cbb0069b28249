//! Several nodes on one in-memory hub.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use loom_net::{MemoryHub, MemoryNetwork};
use loom_shared::types::{ContentId, PeerId, ThreadSharing, ThreadType};
use loom_shared::{Account, Identity};
use loom_store::Datastore;

use crate::cafe::CafeHostConfig;
use crate::content::MemoryContentStore;
use crate::node::{Node, NodeOptions};
use crate::thread::Thread;
use crate::threads::AddThreadConfig;

const TICK: Duration = Duration::from_millis(100);

pub(crate) struct TestNet {
    hub: MemoryHub,
}

pub(crate) struct TestNode {
    pub node: Arc<Node>,
    pub network: MemoryNetwork,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl TestNet {
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
        }
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    async fn spawn(&self, name: &str, cafe_host: Option<CafeHostConfig>, ticker: bool) -> TestNode {
        let identity = Identity::generate();
        let (network, inbound) = self.hub.connect(identity.peer_id());
        let node = Node::new(
            identity,
            Account::generate(),
            Datastore::in_memory().unwrap(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(network.clone()),
            NodeOptions {
                name: name.to_string(),
                cafe_host,
            },
        )
        .unwrap();

        let mut tasks = vec![node.spawn_dispatch(inbound)];
        if ticker {
            tasks.push(node.spawn_ticker(TICK));
        }
        TestNode {
            node,
            network,
            tasks,
        }
    }

    /// A node flushing its queues on a short timer.
    pub async fn node(&self, name: &str) -> TestNode {
        self.spawn(name, None, true).await
    }

    /// A node that only answers traffic; queues move when the test says so.
    pub async fn idle_node(&self, name: &str) -> TestNode {
        self.spawn(name, None, false).await
    }

    pub async fn cafe(&self, name: &str, config: CafeHostConfig) -> TestNode {
        self.spawn(name, Some(config), true).await
    }

    pub fn thread_config(key: &str, thread_type: ThreadType, sharing: ThreadSharing) -> AddThreadConfig {
        AddThreadConfig {
            key: key.to_string(),
            name: key.to_string(),
            schema: None,
            thread_type,
            sharing,
            whitelist: Vec::new(),
        }
    }

    /// A shared thread created by `p` that `q` has joined, with both
    /// sides settled on the same head.
    pub async fn shared_thread(
        &self,
        p: &TestNode,
        q: &TestNode,
        key: &str,
        thread_type: ThreadType,
    ) -> (Arc<Thread>, Arc<Thread>) {
        let pt = p.create_thread(key, thread_type, ThreadSharing::Shared).await;
        p.node.add_contact(&q.node.contact().unwrap()).unwrap();
        pt.add_invite(&q.peer_id()).await.unwrap();

        let invited = wait_until(|| !q.node.threads().invites().unwrap().is_empty()).await;
        assert!(invited, "invite never arrived");
        let invite = q.node.threads().invites().unwrap().remove(0);
        let qt = q.node.threads().accept_invite(&invite.id).await.unwrap();

        let q_id = q.peer_id();
        let settled = wait_until(|| {
            let (a, b) = (pt.head().unwrap(), qt.head().unwrap());
            a == b && pt.peers().unwrap().iter().any(|peer| peer.id == q_id)
        })
        .await;
        assert!(settled, "thread never settled");
        (pt, qt)
    }
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.node.peer_id()
    }

    pub async fn create_thread(&self, key: &str, thread_type: ThreadType, sharing: ThreadSharing) -> Arc<Thread> {
        self.node
            .threads()
            .add_thread(TestNet::thread_config(key, thread_type, sharing))
            .await
            .unwrap()
    }

    pub async fn create_thread_with_schema(
        &self,
        key: &str,
        thread_type: ThreadType,
        sharing: ThreadSharing,
    ) -> Arc<Thread> {
        let mut config = TestNet::thread_config(key, thread_type, sharing);
        config.schema = Some(ContentId::of(b"{\"name\":\"files\"}"));
        self.node.threads().add_thread(config).await.unwrap()
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
