pub mod apikey;
pub mod credential;
pub mod nip04;
pub mod nip44;
pub mod password;
