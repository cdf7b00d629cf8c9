use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use keeld_blockchain::validate::height_commitment;
use keeld_blockchain::{BlockChain, Error, ReorganizePayload, Settings};
use keeld_consensus::money::COIN;
use keeld_consensus::{chain_params, ChainParams, Hash256, Network};
use keeld_pow::validation::check_proof_of_work;
use keeld_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use keeld_primitives::{compute_merkle_root, OutPoint, Transaction, TxIn, TxOut};
use keeld_storage::memory::MemoryStore;

const EASY_BITS: u32 = 0x207f_ffff;
const BASE_TIME: u32 = 1_600_000_000;
const OP_TRUE: u8 = 0x51;

fn params() -> ChainParams {
    chain_params(Network::Regtest)
}

fn coinbase(height: u32, tag: u8) -> Transaction {
    let mut script_sig = height_commitment(height);
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

fn build_block(parent: Hash256, height: u32, tag: u8, extra: Vec<Transaction>) -> Arc<Block> {
    let mut transactions = vec![coinbase(height, tag)];
    transactions.extend(extra);
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let mut header = BlockHeader {
        version: CURRENT_VERSION,
        prev_block: parent,
        merkle_root: compute_merkle_root(&txids),
        time: BASE_TIME + height * 600,
        bits: EASY_BITS,
        nonce: 0,
    };
    let pow_limit = params().consensus.pow_limit;
    while check_proof_of_work(&header.hash(), header.bits, &pow_limit).is_err() {
        header.nonce += 1;
    }
    Arc::new(Block::new(header, transactions))
}

fn spend(prevout: OutPoint, value: i64, script_sig: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Service over a pre-seeded linear chain of `length` blocks.
fn chain_of(length: u32) -> (BlockChain<MemoryStore>, Vec<Arc<Block>>) {
    let service = BlockChain::new(
        Arc::new(MemoryStore::new()),
        params(),
        Settings {
            cores: 2,
            ..Settings::default()
        },
    )
    .expect("service");

    let mut blocks = Vec::new();
    let mut parent = [0u8; 32];
    for height in 0..length {
        let block = build_block(parent, height, 0, Vec::new());
        service.chain().insert(&block, height).expect("insert");
        parent = block.hash();
        blocks.push(block);
    }
    service.start();
    (service, blocks)
}

fn subscribe(service: &BlockChain<MemoryStore>) -> crossbeam_channel::Receiver<ReorganizePayload> {
    let (sender, receiver) = unbounded();
    service.subscribe_reorganize(move |payload| {
        let _ = sender.send(payload);
    });
    receiver
}

fn hashes(blocks: &[Arc<Block>]) -> Vec<Hash256> {
    blocks.iter().map(|block| block.hash()).collect()
}

#[test]
fn linear_extension_commits_and_notifies() {
    let (service, blocks) = chain_of(2);
    let notifications = subscribe(&service);

    let next = build_block(blocks[1].hash(), 2, 0, Vec::new());
    service.organize_block(Arc::clone(&next)).expect("organize");

    assert_eq!(service.chain().fetch_last_height().expect("tip"), 2);
    let payload = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("notification");
    assert_eq!(payload.code, None);
    assert_eq!(payload.branch_height, 1);
    assert_eq!(hashes(&payload.incoming), vec![next.hash()]);
    assert!(payload.outgoing.is_empty());

    // The same block again is a duplicate, with no second notification.
    assert_eq!(service.organize_block(next), Err(Error::DuplicateBlock));
    service.close().expect("close");

    // Closing delivers the stop payload once, and nothing else.
    let stop = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("stop notification");
    assert_eq!(stop.code, Some(Error::ServiceStopped));
    assert!(notifications.try_recv().is_err());
}

#[test]
fn orphan_is_pooled_and_committed_with_its_parent() {
    let (service, blocks) = chain_of(2);
    let notifications = subscribe(&service);

    let child = build_block(blocks[1].hash(), 2, 0, Vec::new());
    let grandchild = build_block(child.hash(), 3, 0, Vec::new());

    assert_eq!(
        service.organize_block(Arc::clone(&grandchild)),
        Err(Error::OrphanBlock)
    );
    // The orphan is retained by the pool.
    let mut inventory = vec![grandchild.hash()];
    service.filter_orphans(&mut inventory);
    assert!(inventory.is_empty());

    // Filling the gap commits both blocks in one branch.
    service
        .organize_block(Arc::clone(&child))
        .expect("organize parent");
    assert_eq!(service.chain().fetch_last_height().expect("tip"), 3);

    let payload = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("notification");
    assert_eq!(
        hashes(&payload.incoming),
        vec![child.hash(), grandchild.hash()]
    );
    assert!(payload.outgoing.is_empty());

    // Neither block remains pooled after commit.
    let mut inventory = vec![child.hash(), grandchild.hash()];
    service.filter_orphans(&mut inventory);
    assert_eq!(inventory.len(), 2);
    service.close().expect("close");
}

#[test]
fn weaker_fork_is_pooled_not_committed() {
    let (service, blocks) = chain_of(3);
    let tip_hash = blocks[2].hash();

    let side1 = build_block(blocks[0].hash(), 1, 9, Vec::new());
    assert_eq!(
        service.organize_block(Arc::clone(&side1)),
        Err(Error::InsufficientWork)
    );

    // Equal cumulative work: the committed chain wins the tie.
    let side2 = build_block(side1.hash(), 2, 9, Vec::new());
    assert_eq!(
        service.organize_block(Arc::clone(&side2)),
        Err(Error::InsufficientWork)
    );

    assert_eq!(service.chain().fetch_last_height().expect("tip"), 2);
    assert_eq!(
        service.chain().get_hash(2).expect("hash"),
        Some(tip_hash)
    );
    let mut inventory = vec![side1.hash(), side2.hash()];
    service.filter_orphans(&mut inventory);
    assert!(inventory.is_empty());

    // Re-announcing a pooled candidate is a duplicate.
    assert_eq!(service.organize_block(side2), Err(Error::DuplicateBlock));
    service.close().expect("close");
}

#[test]
fn heavier_fork_reorganizes_and_repools_the_old_chain() {
    let (service, blocks) = chain_of(3);
    let notifications = subscribe(&service);

    let side1 = build_block(blocks[0].hash(), 1, 9, Vec::new());
    let side2 = build_block(side1.hash(), 2, 9, Vec::new());
    assert_eq!(
        service.organize_block(Arc::clone(&side1)),
        Err(Error::InsufficientWork)
    );
    assert_eq!(
        service.organize_block(Arc::clone(&side2)),
        Err(Error::InsufficientWork)
    );

    let side3 = build_block(side2.hash(), 3, 9, Vec::new());
    service
        .organize_block(Arc::clone(&side3))
        .expect("heavier branch commits");

    assert_eq!(service.chain().fetch_last_height().expect("tip"), 3);
    assert_eq!(
        service.chain().get_hash(3).expect("hash"),
        Some(side3.hash())
    );

    let payload = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("notification");
    assert_eq!(payload.branch_height, 0);
    assert_eq!(
        hashes(&payload.incoming),
        vec![side1.hash(), side2.hash(), side3.hash()]
    );
    // Displaced blocks surface newest first and return to the pool.
    assert_eq!(
        hashes(&payload.outgoing),
        vec![blocks[2].hash(), blocks[1].hash()]
    );
    let mut inventory = vec![blocks[1].hash(), blocks[2].hash()];
    service.filter_orphans(&mut inventory);
    assert!(inventory.is_empty());
    service.close().expect("close");
}

#[test]
fn mature_spend_commits_and_updates_indices() {
    let (service, blocks) = chain_of(101);

    let funded = OutPoint {
        hash: blocks[1].transactions[0].txid(),
        index: 0,
    };
    let payment = spend(funded, 50 * COIN - 1_000, Vec::new());
    let next = build_block(blocks[100].hash(), 101, 0, vec![payment.clone()]);
    service.organize_block(next).expect("organize spend");

    let spend_entry = service.chain().fetch_spend(&funded).expect("spend index");
    assert_eq!(spend_entry.hash, payment.txid());
    assert_eq!(spend_entry.height, 101);
    service.close().expect("close");
}

#[test]
fn immature_coinbase_spend_is_rejected() {
    let (service, blocks) = chain_of(3);

    let funded = OutPoint {
        hash: blocks[1].transactions[0].txid(),
        index: 0,
    };
    let premature = spend(funded, 50 * COIN, Vec::new());
    let next = build_block(blocks[2].hash(), 3, 0, vec![premature]);
    assert_eq!(
        service.organize_block(next),
        Err(Error::InvalidTransaction("premature spend of coinbase"))
    );
    assert_eq!(service.chain().fetch_last_height().expect("tip"), 2);
    service.close().expect("close");
}

#[test]
fn failing_script_rejects_block_untouched() {
    let (service, blocks) = chain_of(101);

    let funded = OutPoint {
        hash: blocks[1].transactions[0].txid(),
        index: 0,
    };
    // Unlocking script leaves a second stack element: clean-stack violation.
    let bad = spend(funded, 50 * COIN, vec![OP_TRUE]);
    let next = build_block(blocks[100].hash(), 101, 0, vec![bad]);

    match service.organize_block(next) {
        Err(Error::InvalidScript(_)) => {}
        other => panic!("expected script rejection, got {other:?}"),
    }
    assert_eq!(service.chain().fetch_last_height().expect("tip"), 100);
    // Nothing was pooled for the rejected block.
    let mut inventory = vec![blocks[1].transactions[0].txid()];
    service.filter_orphans(&mut inventory);
    assert_eq!(inventory.len(), 1);
    service.close().expect("close");
}

#[test]
fn double_spend_across_branch_blocks_is_rejected() {
    let (service, blocks) = chain_of(101);

    let funded = OutPoint {
        hash: blocks[1].transactions[0].txid(),
        index: 0,
    };
    let first = spend(funded, 50 * COIN, Vec::new());
    let second = spend(funded, 50 * COIN - 5, Vec::new());
    let next = build_block(blocks[100].hash(), 101, 0, vec![first, second]);

    assert_eq!(
        service.organize_block(next),
        Err(Error::InvalidTransaction("duplicate spend in branch"))
    );
    service.close().expect("close");
}

#[test]
fn wrong_difficulty_target_is_rejected() {
    let (service, blocks) = chain_of(2);

    // Regtest never retargets, so any other bits value is contextual junk,
    // even though it is self-consistent proof of work.
    let transactions = vec![coinbase(2, 0)];
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let mut header = BlockHeader {
        version: CURRENT_VERSION,
        prev_block: blocks[1].hash(),
        merkle_root: compute_merkle_root(&txids),
        time: BASE_TIME + 2 * 600,
        bits: 0x2007_ffff,
        nonce: 0,
    };
    let pow_limit = params().consensus.pow_limit;
    while check_proof_of_work(&header.hash(), header.bits, &pow_limit).is_err() {
        header.nonce += 1;
    }
    let block = Arc::new(Block::new(header, transactions));

    assert_eq!(
        service.organize_block(block),
        Err(Error::InvalidHeader("incorrect difficulty target"))
    );
    service.close().expect("close");
}

#[test]
fn stopped_service_drains_to_service_stopped() {
    let (service, blocks) = chain_of(2);
    let notifications = subscribe(&service);

    service.stop();
    let next = build_block(blocks[1].hash(), 2, 0, Vec::new());
    assert_eq!(service.organize_block(next), Err(Error::ServiceStopped));
    assert_eq!(service.chain().fetch_last_height().expect("tip"), 1);

    // The stop notification fires exactly once.
    let payload = notifications
        .recv_timeout(Duration::from_secs(5))
        .expect("stop notification");
    assert_eq!(payload.code, Some(Error::ServiceStopped));
    assert!(payload.incoming.is_empty());
    assert!(payload.outgoing.is_empty());

    service.stop();
    service.close().expect("close");
    assert!(notifications.try_recv().is_err());
}

#[test]
fn transaction_organizer_admits_and_notifies() {
    let (service, blocks) = chain_of(101);
    let (sender, receiver) = unbounded();
    service.subscribe_transaction(move |payload| {
        let _ = sender.send(payload);
    });

    let funded = OutPoint {
        hash: blocks[1].transactions[0].txid(),
        index: 0,
    };
    let payment = Arc::new(spend(funded, 50 * COIN - 500, Vec::new()));
    service
        .organize_transaction(Arc::clone(&payment))
        .expect("organize transaction");

    let payload = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("notification");
    assert_eq!(payload.code, None);
    assert_eq!(
        payload.transaction.as_ref().map(|tx| tx.txid()),
        Some(payment.txid())
    );

    // Unconfirmed but fetchable without the confirmation requirement.
    let (fetched, _, _) = service
        .chain()
        .fetch_transaction(&payment.txid(), false)
        .expect("fetch");
    assert_eq!(fetched.txid(), payment.txid());

    // A second admission of the same transaction fails.
    assert_eq!(
        service.organize_transaction(Arc::clone(&payment)),
        Err(Error::OperationFailed)
    );

    // Unknown inputs are rejected outright.
    let missing = Arc::new(spend(
        OutPoint {
            hash: [0x77; 32],
            index: 0,
        },
        1,
        Vec::new(),
    ));
    assert_eq!(
        service.organize_transaction(missing),
        Err(Error::InvalidTransaction("input not found"))
    );
    service.close().expect("close");
}

#[test]
fn queries_run_concurrently_with_organization() {
    let (service, blocks) = chain_of(2);
    let service = Arc::new(service);

    let reader = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            // Hammer the sequence-locked surface while blocks commit.
            for _ in 0..500 {
                let height = service.chain().fetch_last_height().expect("height");
                let (header, at) = service.chain().fetch_block_header(height).expect("header");
                assert_eq!(at, height);
                assert!(header.time >= BASE_TIME);
            }
        })
    };

    let mut parent = blocks[1].hash();
    for height in 2..12u32 {
        let block = build_block(parent, height, 0, Vec::new());
        parent = block.hash();
        service.organize_block(block).expect("organize");
    }

    reader.join().expect("reader");
    assert_eq!(service.chain().fetch_last_height().expect("tip"), 11);
    service.close().expect("close");
}
