//! Trophy issuance rail server

use trophy_rails_issuance::main_entry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    main_entry::run_server().await
}
