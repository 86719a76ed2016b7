//! Random record-payload generation. An out-of-core collaborator (see
//! spec §6): the engine only requires a `Record`; how its payload is
//! produced is the driver's business.

use rand::Rng;

use btree_store::Record;

/// Produce a `Record` for `key` with a random ASCII-lowercase payload of
/// length 1..=30 — ported from `generate_random_record_data` in the
/// original.
pub fn random_record(key: i32) -> Record {
    let mut rng = rand::thread_rng();
    let length = rng.gen_range(1..=30);
    let payload: String = (0..length).map(|_| (b'a' + rng.gen_range(0..26u8)) as char).collect();

    println!("\tGenerated: {} \"{}\"", key, payload);

    Record::new(key, payload).expect("a randomly generated lowercase payload always satisfies Record::new")
}
