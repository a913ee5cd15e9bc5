use std::sync::{Arc, Mutex};

use rand::Rng;

use pagedb::{
    b_plus_tree::BPlusTree,
    common::rid::Rid,
    disk_management::{buffer_pool::BufferPool, disk_manager::DiskManager},
};

fn main() {
    env_logger::init();

    let mut db_path = std::env::temp_dir();
    db_path.push("pagedb_demo.db");
    let file_manager = Arc::new(Mutex::new(
        DiskManager::new(db_path.to_string_lossy().into_owned())
            .expect("could not open the database file"),
    ));
    let buffer_pool = Arc::new(BufferPool::new(64, file_manager));

    let index: BPlusTree<u64> = BPlusTree::new("demo_index", buffer_pool.clone(), 0, 0);

    let mut rng = rand::thread_rng();
    let mut inserted = 0;
    for _ in 0..10_000 {
        let key: u64 = rng.gen();
        if index.insert(key, Rid::new((key >> 32) as u32, key as u32)) {
            inserted += 1;
        }
    }
    println!("inserted {} random keys", inserted);

    println!("smallest five:");
    for (key, rid) in index.iter().take(5) {
        println!("  {} -> ({}, {})", key, rid.page_id(), rid.slot_id());
    }

    buffer_pool.flush_all_pages();
}
