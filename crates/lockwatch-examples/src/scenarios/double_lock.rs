use lockwatch::{LockError, RwMutex, TaskId};

pub fn run() -> Result<(), String> {
    let config = RwMutex::with_name("demo.config", vec!["alpha".to_string()]);

    let mut guard = config.write();
    guard.push("beta".to_string());
    println!("holding demo.config for write; locking it again from the same thread");

    match config.write_checked() {
        Err(err @ LockError::DoubleLock { .. }) => println!("caught: {err}"),
        Err(other) => return Err(format!("unexpected error: {other}")),
        Ok(_) => return Err("second write lock was granted".to_string()),
    }
    drop(guard);

    // The same rule applies to explicit identities.
    let job = TaskId::fresh();
    let held = config.write_as(job).map_err(|e| e.to_string())?;
    match config.read_as(job) {
        Err(err) => println!("caught for {job}: {err}"),
        Ok(_) => return Err("read under own write lock was granted".to_string()),
    }
    drop(held);

    println!("final contents: {:?}", *config.read());
    Ok(())
}
