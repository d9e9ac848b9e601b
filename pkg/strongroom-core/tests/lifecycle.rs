/*
 * strongroom: sealed key management for an encrypted secrets barrier
 * Copyright (C) 2018-2022 Aleksa Sarai <cyphar@cyphar.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::Arc;

use strongroom_core::{
    barrier, decode_root_token,
    seal::{KmsSeal, LocalKms, MultiSeal, SealBackend, ShamirSeal},
    shamir::KeyShare,
    storage::{FileStorage, InmemStorage, Storage},
    Error, GenerateRootCoordinator, IssuedShare, RekeyCoordinator, RootTokenMode, SealConfig,
    SealManager, UnsealRequest,
};

fn plain(shares: &[IssuedShare]) -> Vec<KeyShare> {
    shares
        .iter()
        .map(|share| match share {
            IssuedShare::Plain(share) => share.clone(),
            IssuedShare::Pgp { .. } => panic!("unexpected pgp share"),
        })
        .collect()
}

fn submit_all(manager: &SealManager, shares: &[&KeyShare]) -> Result<bool, Error> {
    let mut nonce = None;
    let mut sealed = true;
    for share in shares {
        let result = manager.unseal(UnsealRequest {
            key: Some(share.to_hex()),
            nonce: nonce.take(),
            reset: false,
        })?;
        sealed = result.sealed;
        nonce = Some(result.nonce).filter(|n| !n.is_empty());
    }
    Ok(sealed)
}

#[test]
fn end_to_end() {
    let storage: Arc<dyn Storage> = Arc::new(InmemStorage::new());
    let manager = SealManager::new(Arc::clone(&storage), Arc::new(ShamirSeal));

    let result = manager.initialize(&SealConfig::new(5, 3)).unwrap();
    let shares = plain(&result.shares);
    assert_eq!(shares.len(), 5);

    let quorum = [&shares[0], &shares[2], &shares[4]];
    assert!(!submit_all(&manager, &quorum).unwrap());

    let value = br#"{"a":1}"#;
    manager.barrier().put("secret/foo", value).unwrap();
    // Nothing reaches storage in the clear.
    let raw = storage.get("secret/foo").unwrap().unwrap();
    assert!(!raw.windows(value.len()).any(|w| w == value));

    manager.seal().unwrap();
    assert!(matches!(
        manager.barrier().get("secret/foo"),
        Err(barrier::Error::Sealed)
    ));

    let first = manager
        .submit_unseal_key(shares[0].clone(), None)
        .unwrap();
    assert!(first.sealed);
    assert!(!submit_all(&manager, &quorum[1..]).unwrap());
    assert_eq!(
        manager.barrier().get("secret/foo").unwrap().as_deref(),
        Some(&value[..])
    );
}

#[test]
fn restart_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        let storage = FileStorage::new(dir.path()).unwrap();
        SealManager::new(Arc::new(storage), Arc::new(ShamirSeal))
    };

    let shares = {
        let manager = open();
        let shares = plain(&manager.initialize(&SealConfig::new(3, 2)).unwrap().shares);
        submit_all(&manager, &[&shares[0], &shares[1]]).unwrap();
        manager.barrier().put("app/config", b"hunter2").unwrap();
        manager.barrier().rotate().unwrap();
        manager.barrier().put("app/other", b"value").unwrap();
        shares
    };

    // A new process starts sealed, with no unseal progress.
    let manager = open();
    let status = manager.status().unwrap();
    assert!(status.initialized && status.sealed);
    assert_eq!((status.threshold, status.shares, status.progress), (2, 3, 0));

    assert!(!submit_all(&manager, &[&shares[2], &shares[1]]).unwrap());
    assert_eq!(manager.barrier().active_term().unwrap(), 2);
    assert_eq!(
        manager.barrier().get("app/config").unwrap().as_deref(),
        Some(&b"hunter2"[..])
    );
    assert_eq!(
        manager.barrier().list("app/").unwrap(),
        vec!["config", "other"]
    );
}

#[test]
fn rekey_and_generate_root() {
    let manager = Arc::new(SealManager::new(
        Arc::new(InmemStorage::new()),
        Arc::new(ShamirSeal),
    ));
    let old = plain(&manager.initialize(&SealConfig::new(5, 3)).unwrap().shares);
    submit_all(&manager, &[&old[0], &old[1], &old[2]]).unwrap();
    manager.barrier().put("secret/foo", b"bar").unwrap();

    let rekey = RekeyCoordinator::new(Arc::clone(&manager));
    let nonce = rekey
        .init(SealConfig {
            verification_required: true,
            ..SealConfig::new(4, 2)
        })
        .unwrap();
    let mut result = rekey.submit_key(old[3].clone(), &nonce).unwrap();
    for share in &old[..2] {
        result = rekey.submit_key(share.clone(), &nonce).unwrap();
    }
    let new = result
        .keys
        .iter()
        .map(|key| key.parse::<KeyShare>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(new.len(), 4);
    let verification_nonce = result.verification_nonce.unwrap();
    rekey.verify(new[3].clone(), &verification_nonce).unwrap();
    assert!(rekey.verify(new[1].clone(), &verification_nonce).unwrap().complete);

    let generate = GenerateRootCoordinator::new(Arc::clone(&manager));
    let init = generate.init(RootTokenMode::Otp).unwrap();
    generate.submit_key(new[0].clone(), &init.nonce).unwrap();
    let done = generate.submit_key(new[2].clone(), &init.nonce).unwrap();
    let token = decode_root_token(&done.encoded_token.unwrap(), &init.otp.unwrap()).unwrap();
    assert!(token.starts_with("s."));

    manager.seal().unwrap();
    assert!(!submit_all(&manager, &[&new[2], &new[3]]).unwrap());
    assert_eq!(
        manager.barrier().get("secret/foo").unwrap().as_deref(),
        Some(&b"bar"[..])
    );
}

#[test]
fn multi_seal_auto_unseal() {
    let primary = Arc::new(LocalKms::generate().with_name("primary"));
    let secondary = Arc::new(LocalKms::generate().with_name("secondary"));
    let seal = |kms: Vec<Arc<LocalKms>>| -> Arc<dyn SealBackend> {
        let members = kms
            .into_iter()
            .map(|kms| Arc::new(KmsSeal::new(kms)) as Arc<dyn SealBackend>)
            .collect();
        Arc::new(MultiSeal::new(members).unwrap())
    };

    let storage: Arc<dyn Storage> = Arc::new(InmemStorage::new());
    let manager = SealManager::new(
        Arc::clone(&storage),
        seal(vec![Arc::clone(&primary), Arc::clone(&secondary)]),
    );
    manager.initialize(&SealConfig::new(3, 2)).unwrap();
    manager.auto_unseal().unwrap();
    manager.barrier().put("secret/foo", b"bar").unwrap();

    // Losing one of the kms keys doesn't lock the barrier.
    let restarted = SealManager::new(storage, seal(vec![secondary]));
    restarted.auto_unseal().unwrap();
    assert_eq!(
        restarted.barrier().get("secret/foo").unwrap().as_deref(),
        Some(&b"bar"[..])
    );
}
