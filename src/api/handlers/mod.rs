mod admin;
mod entities;
mod files;

pub use admin::{health, sweep_orphans};
pub use entities::{
    add_attachment, clear_image, create_entity, delete_entity, get_entity, list_attachments,
    remove_attachment, replace_image,
};
pub use files::{list_files, serve_file};
