use lockwatch::{LockError, RwMutex};

pub fn run() -> Result<(), String> {
    let counter = RwMutex::with_name("demo.counter", 0u64);

    let reading = counter.read();
    println!("read demo.counter = {}; trying to upgrade to a write lock", *reading);

    match counter.write_checked() {
        Err(err @ LockError::LockAfterReadLock { .. }) => println!("caught: {err}"),
        Err(other) => return Err(format!("unexpected error: {other}")),
        Ok(_) => return Err("upgrade was granted while reading".to_string()),
    }

    let seen = *reading;
    drop(reading);

    let mut writing = counter.write();
    *writing = seen + 1;
    println!("released the read lock first; demo.counter is now {}", *writing);
    Ok(())
}
