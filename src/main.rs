fn main() -> anyhow::Result<()> {
    notesync::cli::run()
}
