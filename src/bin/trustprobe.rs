use anyhow::Result;

fn main() -> Result<()> {
    trustprobe::cli::run()
}
