pub use super::claims::Entity as Claims;
pub use super::failed_epochs::Entity as FailedEpochs;
pub use super::his_bets::Entity as HisBets;
pub use super::multi_claims::Entity as MultiClaims;
pub use super::real_bets::Entity as RealBets;
pub use super::rounds::Entity as Rounds;
pub use super::wallet_notes::Entity as WalletNotes;
