use serde::{Deserialize, Serialize};
use skyport_core::http::ApiResponse;
use skyport_core::{AutomatId, CellId, Dimensions, GoodId, LockerCell, ParcelAutomat, UserId};

use crate::token::IssuedToken;

pub fn ok<T>(data: T) -> ApiResponse<T> {
    ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    }
}

pub fn ok_with<T>(data: T, message: impl Into<String>) -> ApiResponse<T> {
    ApiResponse {
        success: true,
        data: Some(data),
        message: Some(message.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UserCreateRequest {
    pub email: String,
    pub name: String,
}

/// A token as handed to its bearer. Timestamps are unix seconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub kind: String,
    pub token: String,
    /// JSON document to encode in the QR code.
    pub rendering: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl From<IssuedToken> for TokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            kind: issued.claims.kind().to_string(),
            token: issued.token,
            rendering: issued.rendering,
            issued_at: issued.issued_at.as_second(),
            expires_at: issued.expires_at.as_second(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GoodCreateRequest {
    pub name: String,
    /// Grams
    pub weight: u32,
    pub dimensions: Dimensions,
    #[serde(default)]
    pub quantity_available: u32,
}

#[derive(Debug, Deserialize)]
pub struct DroneCreateRequest {
    pub model: String,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Deserialize)]
pub struct AutomatCreateRequest {
    pub address: String,
    pub agent_url: String,
    pub number_of_cells: u32,
    pub aruco_id: u32,
    #[serde(default)]
    pub internal_doors: Option<u32>,
    #[serde(default)]
    pub cell_dimensions: Option<Vec<Dimensions>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutomatResponse {
    #[serde(flatten)]
    pub automat: ParcelAutomat,
    pub cells: Vec<LockerCell>,
}

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
    pub cell_id: CellId,
}

#[derive(Debug, Deserialize)]
pub struct OrderCreateRequest {
    pub user_id: UserId,
    pub good_id: GoodId,
    /// Picked automatically when absent.
    #[serde(default)]
    pub parcel_automat_id: Option<AutomatId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmLoadedResponse {
    pub order_id: skyport_core::OrderId,
    pub order_status: skyport_core::OrderStatus,
}
