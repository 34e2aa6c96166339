extern crate shmlock;

use shmlock::*;

pub fn main() {
    let db = Database::create(DEFAULT_MAX_NODES).expect("lock segment creation failed");
    if let Ok(token) = db.start_write() {
        let _ignore = db.end_write(token);
    }
    if let Ok(token) = db.start_read() {
        let _ignore = db.end_read(token);
    }
}
