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

//! Decides which read preference a command actually runs with.

use {
	crate::{common::*, topology::{ClusterDescription, ClusterType}},
	std::fmt
};

/// Where a command that can write its result puts it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandOutput {
	Unspecified,
	Inline,
	Collection
}

impl Default for CommandOutput {
	fn default() -> Self {
		Self::Unspecified
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
	Aggregate,
	CollStats,
	Count,
	DbStats,
	Distinct,
	GeoNear,
	GeoSearch,
	GeoWalk,
	Group,
	IsMaster,
	MapReduce,
	ParallelCollectionScan,
	ReplSetGetStatus,
	Text,
	Compact,
	Create,
	CreateIndexes,
	Delete,
	Drop,
	DropDatabase,
	DropIndexes,
	FindAndModify,
	Fsync,
	Insert,
	RenameCollection,
	ReplSetFreeze,
	ReplSetReconfig,
	ReplSetStepDown,
	Shutdown,
	Update,
	Unknown
}

impl From<&str> for Command {
	fn from(s: &str) -> Self {
		use self::Command::*;
		match s.to_ascii_lowercase().as_str() {
			"aggregate"              => Aggregate,
			"collstats"              => CollStats,
			"count"                  => Count,
			"dbstats"                => DbStats,
			"distinct"               => Distinct,
			"geonear"                => GeoNear,
			"geosearch"              => GeoSearch,
			"geowalk"                => GeoWalk,
			"group"                  => Group,
			"ismaster"               => IsMaster,
			"mapreduce"              => MapReduce,
			"parallelcollectionscan" => ParallelCollectionScan,
			"replsetgetstatus"       => ReplSetGetStatus,
			"text"                   => Text,
			"compact"                => Compact,
			"create"                 => Create,
			"createindexes"          => CreateIndexes,
			"delete"                 => Delete,
			"drop"                   => Drop,
			"dropdatabase"           => DropDatabase,
			"dropindexes"            => DropIndexes,
			"findandmodify"          => FindAndModify,
			"fsync"                  => Fsync,
			"insert"                 => Insert,
			"renamecollection"       => RenameCollection,
			"replsetfreeze"          => ReplSetFreeze,
			"replsetreconfig"        => ReplSetReconfig,
			"replsetstepdown"        => ReplSetStepDown,
			"shutdown"               => Shutdown,
			"update"                 => Update,
			_                        => Unknown
		}
	}
}

impl Command {
	/// Returns true if the command has to run on the primary of a replica set.
	pub fn is_primary_only(self, output: CommandOutput) -> bool {
		use self::Command::*;
		match self {
			Aggregate => output == CommandOutput::Collection,
			MapReduce => output != CommandOutput::Inline,
			CollStats | Count | DbStats | Distinct | GeoNear | GeoSearch | GeoWalk | Group | IsMaster
			| ParallelCollectionScan | ReplSetGetStatus | Text | Unknown => false,
			Compact | Create | CreateIndexes | Delete | Drop | DropDatabase | DropIndexes | FindAndModify
			| Fsync | Insert | RenameCollection | ReplSetFreeze | ReplSetReconfig | ReplSetStepDown
			| Shutdown | Update => true
		}
	}
}

/// The name of a command document's first key plus where its result goes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandRequest {
	name:    String,
	command: Command,
	output:  CommandOutput
}

impl CommandRequest {
	pub fn new(name: &str) -> Self {
		Self { name: name.to_string(), command: Command::from(name), output: CommandOutput::Unspecified }
	}

	pub fn with_output(self, output: CommandOutput) -> Self {
		Self { output, ..self }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn command(&self) -> Command {
		self.command
	}

	pub fn output(&self) -> CommandOutput {
		self.output
	}

	pub fn is_primary_only(&self) -> bool {
		self.command.is_primary_only(self.output)
	}
}

impl fmt::Display for CommandRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name)
	}
}

/// Resolves the read preference `command` runs with. Direct connections and sharded clusters
/// always honor `requested`.
pub fn get_command_read_preference(
	command:   &CommandRequest,
	requested: &ReadPreference,
	cluster:   &ClusterDescription
) -> ReadPreference {
	if cluster.mode() == ClusterConnectionMode::Single
		|| cluster.cluster_type() == ClusterType::Sharded
		|| !command.is_primary_only() {
		return requested.clone();
	}

	if requested.mode != ReadPreferenceMode::Primary {
		tracing::debug!(command = %command, requested = ?requested.mode, "command can only run on the primary");
	}

	ReadPreference::primary()
}
