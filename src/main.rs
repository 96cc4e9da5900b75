use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    finalizer::ConcatFinalizer,
    part_store::{FsPartStore, MemoryPartStore, PartStore},
    upload_service::{UploadSessionManager, spawn_expiry_task},
    user_service::UserService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + admin flags ---
    let (cfg, admin) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting moteve-server with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite and schema ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);
    db::run_migrations(&db).await?;

    let users = UserService::new(db.clone());

    // --- Handle admin mode ---
    if !admin.is_empty() {
        run_admin(&users, &admin).await?;
        tracing::info!("Admin tasks complete.");
        return Ok(()); // exit after admin tasks
    }

    // --- Initialize upload pipeline ---
    let store: Arc<dyn PartStore> = match cfg.part_store {
        config::PartStoreKind::Fs => Arc::new(FsPartStore::new(&cfg.storage_dir)),
        config::PartStoreKind::Memory => Arc::new(MemoryPartStore::new()),
    };
    let finalizer = Arc::new(ConcatFinalizer::new(store.clone(), &cfg.storage_dir));
    let uploads = Arc::new(
        UploadSessionManager::new(
            Arc::new(users.clone()),
            store,
            finalizer,
            cfg.sequence_idle_timeout(),
        )
        .with_part_read_timeout(cfg.part_read_timeout()),
    );
    spawn_expiry_task(uploads.clone(), cfg.sweep_interval());

    let state = state::AppState {
        db: db.clone(),
        base_path: cfg.storage_dir.clone().into(),
        users: Arc::new(users),
        uploads,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the users and groups requested on the command line.
async fn run_admin(users: &UserService, admin: &config::AdminTasks) -> Result<()> {
    if admin.migrate {
        tracing::info!("Database migration complete.");
    }

    for entry in &admin.add_users {
        let mut fields = entry.splitn(3, '\\');
        let (Some(email), Some(password)) = (fields.next(), fields.next()) else {
            anyhow::bail!("--add-user expects `email\\password\\name`, got `{}`", entry);
        };
        let display_name = fields.next().unwrap_or(email);
        users
            .register_user(email, password, display_name)
            .await
            .with_context(|| format!("adding user {}", email))?;
    }

    for entry in &admin.add_groups {
        let Some((email, group)) = entry.split_once('\\') else {
            anyhow::bail!("--add-group expects `email\\group`, got `{}`", entry);
        };
        users
            .create_group(email, group)
            .await
            .with_context(|| format!("adding group {} for {}", group, email))?;
    }

    for entry in &admin.remove_groups {
        let Some((email, group)) = entry.split_once('\\') else {
            anyhow::bail!("--remove-group expects `email\\group`, got `{}`", entry);
        };
        let ids: Vec<i64> = users
            .get_groups(email)
            .await
            .with_context(|| format!("listing groups of {}", email))?
            .into_iter()
            .filter(|g| g.name == group)
            .map(|g| g.id)
            .collect();
        if ids.is_empty() {
            tracing::warn!("User {} has no group named {}", email, group);
            continue;
        }
        users
            .remove_groups(email, &ids)
            .await
            .with_context(|| format!("removing group {} of {}", group, email))?;
    }

    for entry in &admin.add_contacts {
        let Some((email, contact_email)) = entry.split_once('\\') else {
            anyhow::bail!("--add-contact expects `email\\contact email`, got `{}`", entry);
        };
        let contact = users
            .find_user_by_email(contact_email)
            .await?
            .with_context(|| format!("no user {}", contact_email))?;
        users
            .add_contacts(email, &[contact.id])
            .await
            .with_context(|| format!("adding contact {} to {}", contact_email, email))?;
    }

    if let Some(criteria) = &admin.find_users {
        let found = users.find_users(criteria).await?;
        tracing::info!("{} user(s) match `{}`", found.len(), criteria);
        for user in found {
            println!("{}\t{}\t{}", user.id, user.email, user.display_name);
        }
    }

    Ok(())
}
