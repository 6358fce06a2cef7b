//! Bindings listing command

use anyhow::Result;
use clap::Args;
use pipeline_bridge_core::Domain;

#[derive(Args)]
pub struct BindingsCommand {
    /// Only list this domain (image or mesh)
    domain: Option<Domain>,
}

impl BindingsCommand {
    pub fn execute(self) -> Result<()> {
        let domains = match self.domain {
            Some(domain) => vec![domain],
            None => vec![Domain::Image, Domain::Mesh],
        };

        for domain in domains {
            let bindings = domain.bindings();
            println!("{} backends (trial order):", domain);
            for backend in bindings.priority {
                let mut extensions: Vec<&str> = bindings
                    .extensions
                    .iter()
                    .filter(|(_, b)| *b == backend)
                    .map(|(ext, _)| *ext)
                    .collect();
                extensions.sort_unstable();
                let mut mime_types: Vec<&str> = bindings
                    .mime_types
                    .iter()
                    .filter(|(_, b)| *b == backend)
                    .map(|(mime, _)| *mime)
                    .collect();
                mime_types.sort_unstable();

                println!("\n{}", backend);
                println!("  Reader: {}", domain.read_module(backend));
                println!("  Writer: {}", domain.write_module(backend));
                if !extensions.is_empty() {
                    println!("  Extensions: {}", extensions.join(", "));
                }
                if !mime_types.is_empty() {
                    println!("  Mime types: {}", mime_types.join(", "));
                }
            }
            println!();
        }

        Ok(())
    }
}
