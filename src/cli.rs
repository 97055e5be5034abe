use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use crate::controller::{Controller, Phase};
use crate::error::{BlockFsError, Result};

const QUORUM_LOG_EVERY: Duration = Duration::from_secs(30);

const MENU: &str = "Choose an option:\n1. Upload\n2. Download\n3. List the files\n4. Status\n5. Exit\n";

/// Operator menu on stdin. Returns when the operator exits, stdin closes or
/// the controller shuts down some other way.
pub async fn run_menu(controller: Arc<Controller>) -> Result<()> {
    wait_for_quorum(&controller).await;
    if controller.phase() == Phase::ShuttingDown {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(choice) = prompt(&mut lines, MENU).await? else {
            tracing::info!("stdin closed, operator menu stopped");
            return Ok(());
        };

        match choice.as_str() {
            "1" => upload(&controller, &mut lines).await?,
            "2" => download(&controller, &mut lines).await?,
            "3" => list(&controller).await,
            "4" => status(&controller).await,
            "5" => {
                println!("Exiting...");
                controller.shutdown(controller.config().purge_on_exit).await?;
                return Ok(());
            }
            _ => println!("Invalid choice."),
        }

        if controller.phase() == Phase::ShuttingDown {
            return Ok(());
        }
    }
}

async fn wait_for_quorum(controller: &Controller) {
    let registry = controller.registry();
    loop {
        match registry.await_quorum(QUORUM_LOG_EVERY).await {
            Ok(()) => {
                println!(
                    "Minimum required storage nodes ({}) connected. Ready for upload.",
                    registry.quorum()
                );
                return;
            }
            Err(_) if controller.phase() == Phase::ShuttingDown => return,
            Err(e) => tracing::info!("Still waiting: {}", e),
        }
    }
}

async fn upload(controller: &Controller, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    let Some(path) = prompt(lines, "Enter the file path to upload: ").await? else {
        return Ok(());
    };
    let path = Path::new(&path);
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => {
            println!("Error: '{}' does not name a file.", path.display());
            return Ok(());
        }
    };

    match controller.upload_file(path, &name).await {
        Ok(report) => {
            println!(
                "File {} uploaded successfully: {} blocks, {} replicas.",
                name, report.blocks_total, report.replicas_written
            );
            for failure in report.summary().failures {
                println!("  warning: {}", failure);
            }
        }
        Err(BlockFsError::IncompleteUpload(report)) => {
            println!(
                "Error: upload of {} incomplete ({} of {} blocks stored).",
                name, report.blocks_placed, report.blocks_total
            );
            for failure in report.summary().failures {
                println!("  {}", failure);
            }
        }
        Err(e) => println!("Error: {}", e),
    }

    Ok(())
}

async fn download(controller: &Controller, lines: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    let Some(name) = prompt(lines, "Enter the file name to download: ").await? else {
        return Ok(());
    };

    match controller
        .download_to(&name, &controller.config().download_dir)
        .await
    {
        Ok(path) => println!(
            "File {} downloaded successfully. Saved as {}",
            name,
            path.display()
        ),
        Err(BlockFsError::FileNotFound { known, .. }) => {
            println!("Error: File '{}' does not exist.", name);
            println!("The files are:");
            print_tree(&known);
        }
        Err(e) => println!("Error: {}", e),
    }

    Ok(())
}

async fn list(controller: &Controller) {
    let names: Vec<String> = controller
        .list_files()
        .await
        .into_iter()
        .map(|f| f.name)
        .collect();
    print_tree(&names);
}

async fn status(controller: &Controller) {
    let status = controller.status().await;
    println!(
        "Phase: {}  nodes: {}/{}  registrations: {}  files: {}  placement: {}  replicas: {}",
        status.phase,
        status.registered_nodes,
        status.required_nodes,
        status.registrations,
        status.files,
        status.placement,
        status.replication_factor
    );
    for node in status.nodes {
        println!(
            "  {:<22} {:<8} blocks: {:<6} last seen: {}",
            node.id.to_string(),
            node.status.to_string(),
            node.block_count,
            node.last_seen.format("%H:%M:%S")
        );
    }
}

fn print_tree(names: &[String]) {
    println!("root");
    for name in names {
        println!("|\n|\n- - - - -{}", name);
    }
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;

    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}
