pub mod bandwidth_tracker;
pub mod peer;
pub mod pending_piece;
pub mod piece_requestor;
pub mod piece_uploader;
pub mod slots;
pub mod torrent_manager;
