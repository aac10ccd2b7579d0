use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::KadConfig;
use crate::core::identifier::Contact;
use crate::core::storage::Content;
use crate::error::KadError;
use crate::node::{Kad, KadInner};

/// Folder under the home directory holding all node state.
const LOCAL_FOLDER: &str = ".kadnet";

/// Owner id and port, `kad.kns`.
#[derive(Debug, Serialize, Deserialize)]
struct KadFile {
    owner: String,
    port: u16,
}

/// One routing table bucket, `routingtable.kns` holds the whole array.
/// The local contact lives in `node.kns`; keeping the table and the node in
/// separate files is what breaks the node/table reference cycle on disk.
#[derive(Debug, Serialize, Deserialize)]
struct BucketFile {
    depth: usize,
    contacts: Vec<Contact>,
}

fn state_root(config: &KadConfig) -> Result<PathBuf, KadError> {
    match &config.state_root {
        Some(root) => Ok(root.clone()),
        None => std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| {
                KadError::Io(io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))
            }),
    }
}

/// `<root>/.kadnet/nodes/<owner>/`, created on demand.
fn state_folder(root: &Path, owner: &str) -> PathBuf {
    root.join(LOCAL_FOLDER).join("nodes").join(owner)
}

fn write_json<T: Serialize>(folder: &Path, name: &str, value: &T) -> Result<(), KadError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(folder.join(name), bytes)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(folder: &Path, name: &str) -> Result<T, KadError> {
    let bytes = std::fs::read(folder.join(name))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write the four state files for this node.
pub(crate) fn save(inner: &KadInner) -> Result<(), KadError> {
    let root = state_root(&inner.config)?;
    let folder = state_folder(&root, &inner.owner);
    std::fs::create_dir_all(&folder)?;

    write_json(
        &folder,
        "kad.kns",
        &KadFile {
            owner: inner.owner.clone(),
            port: inner.local.port,
        },
    )?;
    write_json(&folder, "node.kns", &inner.local)?;

    let buckets: Vec<BucketFile> = inner
        .routing_table
        .lock()
        .buckets()
        .map(|bucket| BucketFile {
            depth: bucket.depth(),
            contacts: bucket.contacts().copied().collect(),
        })
        .collect();
    write_json(&folder, "routingtable.kns", &buckets)?;

    write_json(&folder, "dht.kns", &inner.store.lock().all())?;

    tracing::info!(owner = %inner.owner, folder = %folder.display(), "state saved");
    Ok(())
}

/// Reconstruct a node from the state files of `owner`. The routing table
/// and content store come back semantically equal to what was saved.
pub(crate) async fn load(owner: &str, config: KadConfig) -> Result<Kad, KadError> {
    let root = state_root(&config)?;
    let folder = state_folder(&root, owner);

    let kad_file: KadFile = read_json(&folder, "kad.kns")?;
    let local: Contact = read_json(&folder, "node.kns")?;
    let buckets: Vec<BucketFile> = read_json(&folder, "routingtable.kns")?;
    let contents: Vec<Content> = read_json(&folder, "dht.kns")?;

    let node = Kad::new(&kad_file.owner, local.id, local.address, kad_file.port, config).await?;
    for bucket in buckets {
        for contact in bucket.contacts {
            node.insert_contact(contact);
        }
    }
    for content in contents {
        node.store_local(content);
    }

    tracing::info!(owner, "state restored");
    Ok(node)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::core::identifier::KadId;
    use crate::core::storage::GetParameter;
    use crate::test_support::test_support::make_contact;

    #[tokio::test]
    async fn save_and_load_reconstruct_equal_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = KadConfig {
            state_root: Some(dir.path().to_path_buf()),
            save_state_on_shutdown: true,
            ..KadConfig::default()
        };

        let node = Kad::new(
            "snapshot-owner",
            KadId::from_text("ASF45678947584567467"),
            Ipv4Addr::LOCALHOST,
            0,
            config.clone(),
        )
        .await
        .unwrap();

        let peers = [
            make_contact(1, 4001, 0x01),
            make_contact(2, 4002, 0x40),
            make_contact(3, 4003, 0x80),
        ];
        for peer in peers {
            node.insert_contact(peer);
        }
        let content = Content::new(KadId::from_hashed(&"doc"), b"snapshotted".to_vec())
            .with_owner("snapshot-owner");
        node.store_local(content.clone());

        let saved_port = node.port();
        node.shutdown().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let restored = Kad::load_from_file("snapshot-owner", config).await.unwrap();
        assert_eq!(restored.owner(), "snapshot-owner");
        assert_eq!(restored.port(), saved_port);
        assert_eq!(restored.local_contact(), node.local_contact());

        let mut expected: Vec<_> = peers.to_vec();
        let mut got = restored.contacts();
        expected.sort_by_key(|c| c.id);
        got.sort_by_key(|c| c.id);
        assert_eq!(got, expected);

        let held = restored.contents();
        assert_eq!(held, vec![content.clone()]);
        assert!(restored
            .get(GetParameter::new(content.key), 1)
            .await
            .unwrap()
            .contains(&content));

        restored.shutdown().await.unwrap();
    }
}
