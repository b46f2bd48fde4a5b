// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! The authentication hook run on every freshly opened data connection.
//!
//! Mechanism conversations are not implemented here, an [`Authenticator`] is handed the
//! established connection and either succeeds or reports the mechanism's error.

use {
	crate::connection::InternalConnection,
	std::{fmt, str::FromStr, sync::Arc},
	serde::{Deserialize, Deserializer}
};

pub type AuthError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credential {
	pub username:  Option<String>,
	pub password:  Option<String>,
	pub source:    Option<String>,
	pub mechanism: Option<AuthMech>
}

impl Credential {
	/// The database the user is defined in, `admin` unless set.
	pub fn source(&self) -> &str {
		self.source.as_deref().unwrap_or("admin")
	}
}

impl fmt::Debug for Credential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credential")
			.field("username", &self.username)
			.field("password", &self.password.as_ref().map(|_| "***"))
			.field("source", &self.source)
			.field("mechanism", &self.mechanism)
			.finish()
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AuthMech {
	MongoDbX509,
	GssApi,
	Plain,
	MongoDbCr,
	ScramSha1,
	ScramSha256
}

impl AuthMech {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::MongoDbX509 => "MONGODB-X509",
			Self::GssApi      => "GSSAPI",
			Self::Plain       => "PLAIN",
			Self::MongoDbCr   => "MONGODB-CR",
			Self::ScramSha1   => "SCRAM-SHA-1",
			Self::ScramSha256 => "SCRAM-SHA-256"
		}
	}
}

impl fmt::Display for AuthMech {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AuthMech {
	type Err = crate::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"MONGODB-X509"  => Self::MongoDbX509,
			"GSSAPI"        => Self::GssApi,
			"PLAIN"         => Self::Plain,
			"MONGODB-CR"    => Self::MongoDbCr,
			"SCRAM-SHA-1"   => Self::ScramSha1,
			"SCRAM-SHA-256" => Self::ScramSha256,
			_ => return Err(crate::Error::InvalidSettings(format!("unknown auth mechanism `{}`", s)))
		})
	}
}

impl<'de> Deserialize<'de> for AuthMech {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: Deserializer<'de> {
		String::deserialize(deserializer)?.parse().map_err(serde::de::Error::custom)
	}
}

/// Authenticates a connection before it is handed to the pool.
pub trait Authenticator: Send + Sync + fmt::Debug {
	fn credential(&self) -> &Credential;

	fn authenticate(&self, connection: &mut InternalConnection) -> std::result::Result<(), AuthError>;
}

/// One mechanism's conversation with the server.
pub trait Mechanism: Send + Sync + fmt::Debug {
	fn mechanism(&self) -> AuthMech;

	fn authenticate(&self, credential: &Credential, connection: &mut InternalConnection)
		-> std::result::Result<(), AuthError>;
}

/// Runs the registered [`Mechanism`] named by the credential.
#[derive(Debug, Clone)]
pub struct CredentialAuthenticator {
	credential: Credential,
	mechanisms: Vec<Arc<dyn Mechanism>>
}

impl CredentialAuthenticator {
	pub fn new(credential: Credential, mechanisms: Vec<Arc<dyn Mechanism>>) -> Self {
		Self { credential, mechanisms }
	}
}

impl Authenticator for CredentialAuthenticator {
	fn credential(&self) -> &Credential {
		&self.credential
	}

	fn authenticate(&self, connection: &mut InternalConnection) -> std::result::Result<(), AuthError> {
		let mechanism = self.credential.mechanism
			.ok_or("the credential does not name an authentication mechanism")?;
		let handler = self.mechanisms.iter()
			.find(|handler| handler.mechanism() == mechanism)
			.ok_or_else(|| format!("authentication mechanism {} is not supported", mechanism))?;

		tracing::debug!(address = %connection.address(), connection_id = connection.id(),
			mechanism = %mechanism, source = self.credential.source(), "authenticating connection");
		handler.authenticate(&self.credential, connection)
	}
}
