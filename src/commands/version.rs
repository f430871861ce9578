use anyhow::Result;

pub fn run() -> Result<()> {
    println!("kubewarden-controller {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
