/*! Integration tests for Peerlog.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - entry: Tests for Entry creation, encoding and tamper detection
 * - log: Tests for append, join, convergence and authorization
 * - storage: Tests for the Storage trait and its backends
 * - database: Tests for Database append, broadcast and sync
 * - exchange: Tests for the heads exchange between peers
 * - properties: Property tests for the join algebra
 */

mod database;
mod exchange;
mod log;
